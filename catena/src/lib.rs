//! Boot sequence for the standalone VM binary.

pub mod options;

use {
    self::options::Options,
    anyhow::Context as _,
    catena_core::{
        cell::Cell,
        debug, image,
        special::{OBJ_IMAGE_PATH, OBJ_RESOURCE_PATH},
        vm::{Vm, VmParameters},
    },
    log::{info, warn},
};

/// Environment variables consulted at boot.
const ENV_DEBUG: &str = "CATENA_DEBUG";
const ENV_SKIP_GC_STARTUP: &str = "CATENA_SKIP_GC_STARTUP";
const ENV_NOOP_GC: &str = "CATENA_NOOP_GC";
const ENV_WORD_COUNTER: &str = "CATENA_WORD_COUNTER";
const ENV_VALIDATE_STACK: &str = "CATENA_VALIDATE_STACK";

fn env_flag(name: &str) -> bool
{
    std::env::var_os(name).is_some_and(|value| !value.is_empty())
}

fn init_logging()
{
    let mut builder = env_logger::Builder::from_default_env();
    if env_flag(ENV_DEBUG) {
        builder.filter_level(log::LevelFilter::Trace);
    }
    let _ = builder.try_init();
}

fn parameters_for(options: &Options) -> anyhow::Result<VmParameters>
{
    let mut params = VmParameters::default();
    let kib = |n: u32| n as Cell * 1024;
    let mib = |n: u32| n as Cell * 1024 * 1024;

    if let Some(n) = options.datastack_kib {
        params.datastack_size = kib(n);
    }
    if let Some(n) = options.retainstack_kib {
        params.retainstack_size = kib(n);
    }
    if let Some(n) = options.callstack_kib {
        params.callstack_size = kib(n);
    }
    if let Some(n) = options.young_mib {
        params.young_size = mib(n);
    }
    if let Some(n) = options.aging_mib {
        params.aging_size = mib(n);
    }
    if let Some(n) = options.tenured_mib {
        params.tenured_size = mib(n);
    }
    if let Some(n) = options.codeheap_mib {
        params.code_size = mib(n);
    }

    // Size tenured to fit the image, plus the promotion headroom the
    // collectors rely on.
    if let Some(path) = &options.image {
        let header = image::read_header(path)
            .with_context(|| format!("reading image header from {}", path.display()))?;
        let needed = header.data_size
            + (params.young_size + params.aging_size) * 2;
        params.tenured_size = params.tenured_size.max(needed);
    }
    Ok(params)
}

fn boot(options: &Options) -> anyhow::Result<Vm>
{
    let params = parameters_for(options)?;
    let mut vm = Vm::new(params);

    // Collections stay off through init as a sanity check; nothing
    // allocated here should need one.
    vm.gc_off = true;
    vm.noop_gc = env_flag(ENV_NOOP_GC);
    vm.validate_stack = env_flag(ENV_VALIDATE_STACK);
    if env_flag(ENV_WORD_COUNTER) {
        vm.word_counters = Some(Default::default());
    }

    match &options.image {
        Some(path) => {
            image::load(&mut vm, path)
                .with_context(|| format!("loading image {}", path.display()))?;
            let image_path = vm.string_from_bytes(
                path.display().to_string().as_bytes(),
            );
            vm.special_objects[OBJ_IMAGE_PATH] = image_path;
        },
        None => {
            info!("no image given; bootstrapping a minimal environment");
            vm.bootstrap_minimal();
        },
    }

    if let Some(resource_path) = &options.resource_path {
        let string = vm.string_from_bytes(resource_path.as_bytes());
        vm.special_objects[OBJ_RESOURCE_PATH] = string;
    }
    vm.pass_args(&options.positional);

    if env_flag(ENV_SKIP_GC_STARTUP) {
        warn!("leaving collections off through startup ({ENV_SKIP_GC_STARTUP})");
    } else {
        vm.gc_off = false;
    }
    Ok(vm)
}

/// Parse arguments, boot, run, and return the process exit code.
pub fn run(args: Vec<String>) -> i32
{
    init_logging();

    let options = match Options::parse(args) {
        Ok(options) => options,
        Err(error) => {
            eprintln!("catena: {error}");
            return 1;
        },
    };

    let mut vm = match boot(&options) {
        Ok(vm) => vm,
        Err(error) => {
            eprintln!("catena: {error:#}");
            return 1;
        },
    };

    if options.fep {
        debug::debugger_repl(&mut vm);
    }

    vm.run_startup();

    // Startup may have run with collections off for diagnosis; the
    // evaluator below must not.
    vm.gc_off = false;

    if let Some(expr) = &options.eval {
        match vm.eval_string(expr) {
            Some(result) => println!("{result}"),
            None => {
                eprintln!("catena: -e given but no evaluator is installed");
                return 1;
            },
        }
    }

    if vm.word_counters.is_some() {
        debug::dump_word_counters(&vm, &mut std::io::stderr().lock());
    }
    0
}
