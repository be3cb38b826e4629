//! The command-line surface.
//!
//! Options use the VM's traditional `-name=value` syntax; anything
//! else is a positional argument handed to the language via the args
//! special object. Stack sizes are in KiB, generation sizes in MiB.

use {std::path::PathBuf, thiserror::Error};

#[derive(Debug, Error)]
pub enum OptionsError
{
    #[error("option {0} expects a number")]
    BadNumber(String),

    #[error("unknown option {0}")]
    Unknown(String),
}

#[derive(Clone, Debug, Default)]
pub struct Options
{
    pub image: Option<PathBuf>,
    pub datastack_kib: Option<u32>,
    pub retainstack_kib: Option<u32>,
    pub callstack_kib: Option<u32>,
    pub young_mib: Option<u32>,
    pub aging_mib: Option<u32>,
    pub tenured_mib: Option<u32>,
    pub codeheap_mib: Option<u32>,
    pub resource_path: Option<String>,
    pub eval: Option<String>,
    pub fep: bool,
    pub positional: Vec<String>,
}

fn number(name: &str, value: &str) -> Result<u32, OptionsError>
{
    value.parse().map_err(|_| OptionsError::BadNumber(name.to_string()))
}

impl Options
{
    /// Parse everything after the program name.
    pub fn parse(args: impl IntoIterator<Item = String>)
        -> Result<Self, OptionsError>
    {
        let mut options = Self::default();
        for arg in args {
            if let Some((name, value)) = arg
                .strip_prefix('-')
                .and_then(|rest| rest.split_once('='))
                .map(|(name, value)| (name.to_string(), value.to_string()))
            {
                match name.as_str() {
                    "image" => options.image = Some(PathBuf::from(value)),
                    "datastack" =>
                        options.datastack_kib = Some(number(&name, &value)?),
                    "retainstack" =>
                        options.retainstack_kib = Some(number(&name, &value)?),
                    "callstack" =>
                        options.callstack_kib = Some(number(&name, &value)?),
                    "young" =>
                        options.young_mib = Some(number(&name, &value)?),
                    "aging" =>
                        options.aging_mib = Some(number(&name, &value)?),
                    "tenured" =>
                        options.tenured_mib = Some(number(&name, &value)?),
                    "codeheap" =>
                        options.codeheap_mib = Some(number(&name, &value)?),
                    "resource-path" =>
                        options.resource_path = Some(value),
                    "e" => options.eval = Some(value),
                    _ => return Err(OptionsError::Unknown(arg)),
                }
            } else if arg == "-fep" {
                options.fep = true;
            } else {
                options.positional.push(arg);
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn parse(args: &[&str]) -> Options
    {
        Options::parse(args.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn flags_and_positionals_separate()
    {
        let options = parse(&[
            "-image=boot.image",
            "-young=4",
            "-e=2 3 + .",
            "-fep",
            "input.txt",
        ]);
        assert_eq!(options.image.as_deref().unwrap().to_str(), Some("boot.image"));
        assert_eq!(options.young_mib, Some(4));
        assert_eq!(options.eval.as_deref(), Some("2 3 + ."));
        assert!(options.fep);
        assert_eq!(options.positional, vec!["input.txt".to_string()]);
    }

    #[test]
    fn values_keep_their_equals_signs()
    {
        let options = parse(&["-e=x=1"]);
        assert_eq!(options.eval.as_deref(), Some("x=1"));
    }

    #[test]
    fn bad_numbers_are_rejected()
    {
        let error =
            Options::parse(vec!["-young=lots".to_string()]).unwrap_err();
        assert!(matches!(error, OptionsError::BadNumber(_)));
    }
}
