//! The image format: a relocatable dump of the tenured heap.
//!
//! Save and load are mirror images. Saving compacts the heap so the
//! live data is one contiguous run at the bottom of tenured, then
//! writes the header and the raw cells. Loading copies the data back
//! into tenured and adds `actual base − image base` to every pointer
//! slot, walking objects by their headers. Portability across cell
//! sizes or endianness is not attempted; the discriminator catches a
//! mismatch and aborts the load.

use {
    crate::{
        cell::{immediate_p, untag, Cell},
        gc::{Fixup, GcOp, SlotVisitor},
        heap::DataHeap,
        object,
        special::{OBJ_STARTUP_QUOT, SPECIAL_OBJECT_COUNT},
        vm::Vm,
    },
    log::{debug, info},
    std::{fs, io, path::Path},
    thiserror::Error,
};

pub const IMAGE_MAGIC: u32 = 0x0f0e_0d0c;

/// Cell size and byte order of the saving VM: 4-byte little-endian.
pub const IMAGE_DISCRIMINATOR: u32 = u32::from_le_bytes(*b"c4le");

pub const IMAGE_VERSION: u32 = 1;

const HEADER_BYTES: usize = 44;

#[derive(Debug, Error)]
pub enum ImageError
{
    #[error("cannot read image: {0}")]
    Io(#[from] io::Error),

    #[error("not an image file (bad magic)")]
    BadMagic,

    #[error("image was saved by an incompatible VM (cell size or byte order)")]
    BadDiscriminator,

    #[error("unsupported image version {0}")]
    BadVersion(u32),

    #[error("image is truncated")]
    Truncated,

    #[error("image data ({data} bytes) does not fit in tenured ({tenured} bytes)")]
    TooLarge
    {
        data: Cell,
        tenured: Cell,
    },
}

/// The fixed-size image header.
#[derive(Clone, Copy, Debug)]
pub struct ImageHeader
{
    pub image_base: Cell,
    pub data_size: Cell,
    pub startup_quot: Cell,
    pub specials: Cell,
    pub young_size: Cell,
    pub aging_size: Cell,
    pub tenured_size: Cell,
    pub code_size: Cell,
}

impl ImageHeader
{
    fn to_bytes(self) -> [u8; HEADER_BYTES]
    {
        let mut bytes = [0u8; HEADER_BYTES];
        let fields = [
            IMAGE_MAGIC,
            IMAGE_DISCRIMINATOR,
            IMAGE_VERSION,
            self.image_base,
            self.data_size,
            self.startup_quot,
            self.specials,
            self.young_size,
            self.aging_size,
            self.tenured_size,
            self.code_size,
        ];
        for (index, field) in fields.into_iter().enumerate() {
            bytes[index * 4..index * 4 + 4]
                .copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError>
    {
        if bytes.len() < HEADER_BYTES {
            return Err(ImageError::Truncated);
        }
        let field = |index: usize| {
            u32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
        };
        if field(0) != IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        if field(1) != IMAGE_DISCRIMINATOR {
            return Err(ImageError::BadDiscriminator);
        }
        if field(2) != IMAGE_VERSION {
            return Err(ImageError::BadVersion(field(2)));
        }
        Ok(Self{
            image_base: field(3),
            data_size: field(4),
            startup_quot: field(5),
            specials: field(6),
            young_size: field(7),
            aging_size: field(8),
            tenured_size: field(9),
            code_size: field(10),
        })
    }
}

/// Read just the header, for sizing the heap before boot.
pub fn read_header(path: &Path) -> Result<ImageHeader, ImageError>
{
    let mut bytes = [0u8; HEADER_BYTES];
    let data = fs::read(path)?;
    if data.len() < HEADER_BYTES {
        return Err(ImageError::Truncated);
    }
    bytes.copy_from_slice(&data[..HEADER_BYTES]);
    ImageHeader::from_bytes(&bytes)
}

/// Relocation by a fixed offset, applied both to pointers and to the
/// addresses the object walk reads sizes through.
struct ImageFixup
{
    delta: Cell,
}

impl Fixup for ImageFixup
{
    fn fixup(&mut self, _heap: &mut DataHeap, addr: Cell) -> Cell
    {
        addr.wrapping_add(self.delta)
    }

    fn translate(&self, addr: Cell) -> Cell
    {
        addr.wrapping_add(self.delta)
    }
}

/// Save the VM state to `path`.
///
/// Runs a compacting collection first, so the tenured heap is one
/// contiguous run of live objects starting at its base.
pub fn save(vm: &mut Vm, path: &Path) -> Result<(), ImageError>
{
    // Snapshot the special objects into a heap array so they ride
    // along with the data region and relocate like everything else.
    let specials = vm.allot_array(SPECIAL_OBJECT_COUNT as Cell, crate::cell::FALSE);
    for index in 0..SPECIAL_OBJECT_COUNT {
        let value = vm.special_objects[index];
        vm.heap.set_slot(
            untag(specials),
            object::ARRAY_DATA + index as Cell * 4,
            value,
        );
    }
    let specials_root = vm.data_roots.push(specials);

    vm.gc(GcOp::Compact, 0);

    let specials = vm.data_roots.pop(specials_root);
    let base = vm.heap.tenured.allocator.start;
    let data_size = vm.heap.tenured.allocator.occupied_space();

    let header = ImageHeader{
        image_base: base,
        data_size,
        startup_quot: vm.special_objects[OBJ_STARTUP_QUOT],
        specials,
        young_size: vm.heap.nursery.size,
        aging_size: vm.heap.aging.allocator.size,
        tenured_size: vm.heap.tenured.allocator.size,
        code_size: 0,
    };

    let mut bytes = Vec::with_capacity(HEADER_BYTES + data_size as usize);
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(vm.heap.mem.slice(base, data_size));
    fs::write(path, bytes)?;

    info!("saved image: {data_size:#x} data bytes at base {base:#x}");
    Ok(())
}

/// Load an image into a freshly built VM. The tenured generation must
/// be large enough for the image data.
pub fn load(vm: &mut Vm, path: &Path) -> Result<(), ImageError>
{
    let bytes = fs::read(path)?;
    let header = ImageHeader::from_bytes(&bytes)?;

    let base = vm.heap.tenured.allocator.start;
    let tenured_size = vm.heap.tenured.allocator.size;
    if header.data_size > tenured_size {
        return Err(ImageError::TooLarge{
            data: header.data_size,
            tenured: tenured_size,
        });
    }
    let data = bytes
        .get(HEADER_BYTES..HEADER_BYTES + header.data_size as usize)
        .ok_or(ImageError::Truncated)?;
    vm.heap.mem.slice_mut(base, header.data_size).copy_from_slice(data);

    // Apply the relocation delta to every pointer slot, walking the
    // region object by object.
    let delta = base.wrapping_sub(header.image_base);
    debug!("image relocation delta {delta:#x}");
    {
        let mut visitor = SlotVisitor::new(&mut vm.heap, ImageFixup{delta});
        let mut scan = base;
        let end = base + header.data_size;
        while scan < end {
            visitor.visit_slots(scan);
            scan += object::object_size_with(
                &visitor.heap.mem,
                scan,
                |addr| addr.wrapping_add(delta),
            );
        }
    }

    // Rebuild the tenured bookkeeping around the loaded data.
    {
        let DataHeap{mem, tenured, ..} = &mut vm.heap;
        tenured.allocator.initial_free_list(mem, header.data_size);
        tenured.update_starts_for_sweep(mem);
    }

    // Unpack the special objects.
    let relocate = |cell: Cell| {
        if immediate_p(cell) { cell } else { cell.wrapping_add(delta) }
    };
    let specials = untag(relocate(header.specials));
    for index in 0..SPECIAL_OBJECT_COUNT {
        vm.special_objects[index] =
            object::array_nth(&vm.heap.mem, specials, index as Cell);
    }
    vm.special_objects[OBJ_STARTUP_QUOT] = relocate(header.startup_quot);

    info!(
        "loaded image: {:#x} data bytes, startup quotation {:#x}",
        header.data_size,
        vm.special_objects[OBJ_STARTUP_QUOT],
    );
    Ok(())
}
