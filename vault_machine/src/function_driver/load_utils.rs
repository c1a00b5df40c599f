use crate::{memory_domain::AddressSpace, page_align_up, ImageInfo};
use log::{debug, trace};
use object::{
    pe::ImageNtHeaders64,
    read::pe::{ImageNtHeaders, ImageOptionalHeader, Import, PeFile64},
    LittleEndian as LE, Object, ObjectSection,
};
use std::path::Path;
use vault_commons::{VaultError, VaultResult};

/// Bytes reserved per bound import in the stub area behind the image
const STUB_SIZE: u64 = 0x10;
/// Imports the sandbox can stand in for, with the code of their stub
const KNOWN_STUBS: [(&str, &[u8]); 1] = [
    // stack probing is meaningless on the fully mapped sandbox stack
    ("__chkstk", &[0xC3]),
];
/// ud2, calling any other import faults
const TRAP_STUB: [u8; 2] = [0x0F, 0x0B];

pub fn load_u8_from_file(full_path: &Path) -> VaultResult<Vec<u8>> {
    std::fs::read(full_path)
        .map_err(|err| VaultError::FileError(format!("{}: {}", full_path.display(), err)))
}

/// Map a module into the address space.
/// PE32+ files are placed at their preferred image base without relocation, their imports
/// are bound to stubs placed behind the image.
/// Anything else is treated as a flat image placed at `raw_base`.
pub fn load_image(space: &mut AddressSpace, file: &[u8], raw_base: u64) -> VaultResult<ImageInfo> {
    if file.starts_with(b"MZ") {
        load_pe(space, file)
    } else {
        let image = ImageInfo {
            base: raw_base,
            size: file.len() as u64,
        };
        space.map_with(raw_base, file.len() as u64, file)?;
        debug!(
            "mapped raw image at {:#x}, {:#x} bytes",
            image.base, image.size
        );
        Ok(image)
    }
}

fn load_pe(space: &mut AddressSpace, file: &[u8]) -> VaultResult<ImageInfo> {
    let malformed = |err: object::Error| VaultError::MalformedImage(err.to_string());
    let pe = PeFile64::parse(file).map_err(malformed)?;
    let optional_header = pe.nt_headers().optional_header();
    let image = ImageInfo {
        base: pe.relative_address_base(),
        size: u64::from(optional_header.size_of_image()),
    };
    let header_size = (optional_header.size_of_headers() as usize).min(file.len());
    space.map_with(image.base, image.size, &file[..header_size])?;
    for section in pe.sections() {
        let data = section.data().map_err(malformed)?;
        let address = section.address();
        if address < image.base || address + data.len() as u64 > image.end() {
            return Err(VaultError::MalformedImage(format!(
                "section {} at {:#x} lies outside of the image",
                section.name().unwrap_or("?"),
                address
            )));
        }
        trace!(
            "section {} at {:#x}, {:#x} bytes",
            section.name().unwrap_or("?"),
            address,
            data.len()
        );
        space.write(address, data)?;
    }
    debug!(
        "mapped PE image at {:#x}, {:#x} bytes",
        image.base, image.size
    );
    bind_imports(space, &pe, image)?;
    Ok(image)
}

/// Import address table slot and the import it stands for
struct Binding {
    slot: u64,
    library: String,
    name: String,
}

fn bind_imports(space: &mut AddressSpace, pe: &PeFile64, image: ImageInfo) -> VaultResult<()> {
    let malformed = |err: object::Error| VaultError::MalformedImage(err.to_string());
    let Some(table) = pe.import_table().map_err(malformed)? else {
        return Ok(());
    };
    let mut bindings = Vec::new();
    let mut descriptors = table.descriptors().map_err(malformed)?;
    while let Some(descriptor) = descriptors.next().map_err(malformed)? {
        let library = table.name(descriptor.name.get(LE)).map_err(malformed)?;
        let library = String::from_utf8_lossy(library).into_owned();
        let first_thunk = descriptor.first_thunk.get(LE);
        // bound images may only carry the address table
        let lookup = match descriptor.original_first_thunk.get(LE) {
            0 => first_thunk,
            address => address,
        };
        let mut thunks = table.thunks(lookup).map_err(malformed)?;
        let mut slot = image.base + u64::from(first_thunk);
        while let Some(thunk) = thunks.next::<ImageNtHeaders64>().map_err(malformed)? {
            let name = match table.import::<ImageNtHeaders64>(thunk).map_err(malformed)? {
                Import::Name(_, name) => String::from_utf8_lossy(name).into_owned(),
                Import::Ordinal(ordinal) => format!("#{}", ordinal),
            };
            bindings.push(Binding {
                slot,
                library: library.clone(),
                name,
            });
            slot += 8;
        }
    }
    if bindings.is_empty() {
        return Ok(());
    }

    let stub_base = page_align_up(image.end()).ok_or_else(|| {
        VaultError::MalformedImage(String::from("no room for import stubs behind the image"))
    })?;
    space.map(stub_base, bindings.len() as u64 * STUB_SIZE)?;
    for (index, binding) in bindings.iter().enumerate() {
        let stub = stub_base + index as u64 * STUB_SIZE;
        let code = KNOWN_STUBS
            .iter()
            .find(|(name, _)| *name == binding.name)
            .map_or(&TRAP_STUB[..], |(_, code)| *code);
        space.write(stub, code)?;
        space.write(binding.slot, &stub.to_le_bytes())?;
        trace!(
            "import {}!{} bound to {:#x}",
            binding.library,
            binding.name,
            stub
        );
    }
    debug!(
        "bound {} imports to stubs at {:#x}",
        bindings.len(),
        stub_base
    );
    Ok(())
}

#[test]
fn raw_image_is_mapped_at_base() {
    let mut space = AddressSpace::new();
    let image = load_image(&mut space, &[0x90, 0x90, 0xC3], 0x1_4000_0000)
        .expect("raw images always load");
    assert_eq!(
        ImageInfo {
            base: 0x1_4000_0000,
            size: 3
        },
        image
    );
    assert_eq!(
        vec![0x90, 0x90, 0xC3],
        space.read(0x1_4000_0000, 3).expect("image is mapped")
    );
}

#[test]
fn truncated_pe_is_rejected() {
    let mut space = AddressSpace::new();
    match load_image(&mut space, b"MZ\x90\x00", 0) {
        Err(VaultError::MalformedImage(_)) => (),
        other => panic!("expected malformed image, got {:?}", other),
    }
}

/// Smallest PE32+ image with one section and one import descriptor for
/// `ntoskrnl.exe`, importing `__chkstk` and `KeBugCheckEx`.
/// The code at `+0x1000` loads 0x1234 into rax, calls `__chkstk` through the import
/// address table at `+0x1160` and stores rax to `[r8]`.
#[cfg(test)]
pub(crate) fn import_fixture() -> Vec<u8> {
    fn put(file: &mut [u8], offset: usize, bytes: &[u8]) {
        file[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    // file offset of the section, which lives at rva 0x1000
    fn text(rva: usize) -> usize {
        rva - 0x1000 + 0x200
    }
    let mut file = vec![0u8; 0x400];
    put(&mut file, 0, b"MZ");
    put(&mut file, 0x3C, &0x40u32.to_le_bytes());
    put(&mut file, 0x40, b"PE\0\0");
    // file header
    put(&mut file, 0x44, &0x8664u16.to_le_bytes());
    put(&mut file, 0x46, &1u16.to_le_bytes());
    put(&mut file, 0x54, &0xF0u16.to_le_bytes());
    put(&mut file, 0x56, &0x22u16.to_le_bytes());
    // optional header
    let optional = 0x58;
    put(&mut file, optional, &0x20Bu16.to_le_bytes());
    put(&mut file, optional + 16, &0x1000u32.to_le_bytes());
    put(&mut file, optional + 24, &IMPORT_FIXTURE_BASE.to_le_bytes());
    put(&mut file, optional + 32, &0x1000u32.to_le_bytes());
    put(&mut file, optional + 36, &0x200u32.to_le_bytes());
    put(&mut file, optional + 48, &6u16.to_le_bytes());
    put(&mut file, optional + 56, &0x2000u32.to_le_bytes());
    put(&mut file, optional + 60, &0x200u32.to_le_bytes());
    put(&mut file, optional + 68, &1u16.to_le_bytes());
    put(&mut file, optional + 108, &16u32.to_le_bytes());
    // import directory
    put(&mut file, optional + 120, &0x1100u32.to_le_bytes());
    put(&mut file, optional + 124, &40u32.to_le_bytes());
    // section table
    let section = optional + 0xF0;
    put(&mut file, section, b".text\0\0\0");
    put(&mut file, section + 8, &0x200u32.to_le_bytes());
    put(&mut file, section + 12, &0x1000u32.to_le_bytes());
    put(&mut file, section + 16, &0x200u32.to_le_bytes());
    put(&mut file, section + 20, &0x200u32.to_le_bytes());
    put(&mut file, section + 36, &0x6000_0020u32.to_le_bytes());
    put(
        &mut file,
        text(0x1000),
        &[
            0x48, 0xC7, 0xC0, 0x34, 0x12, 0x00, 0x00, // mov rax, 0x1234
            0xFF, 0x15, 0x53, 0x01, 0x00, 0x00, // call [rip+0x153]
            0x49, 0x89, 0x00, // mov [r8], rax
            0xC3, // ret
        ],
    );
    // import descriptor, the null descriptor after it stays zero
    put(&mut file, text(0x1100), &0x1140u32.to_le_bytes());
    put(&mut file, text(0x110C), &0x1180u32.to_le_bytes());
    put(&mut file, text(0x1110), &0x1160u32.to_le_bytes());
    for table in [0x1140, 0x1160] {
        put(&mut file, text(table), &0x11A0u64.to_le_bytes());
        put(&mut file, text(table + 8), &0x11B0u64.to_le_bytes());
    }
    put(&mut file, text(0x1180), b"ntoskrnl.exe\0");
    put(&mut file, text(0x11A2), b"__chkstk\0");
    put(&mut file, text(0x11B2), b"KeBugCheckEx\0");
    file
}

#[cfg(test)]
pub(crate) const IMPORT_FIXTURE_BASE: u64 = 0x1_4000_0000;

#[test]
fn imports_are_bound_to_stubs() {
    let mut space = AddressSpace::new();
    let image = load_image(&mut space, &import_fixture(), 0).expect("fixture is a valid PE");
    assert_eq!(
        ImageInfo {
            base: IMPORT_FIXTURE_BASE,
            size: 0x2000
        },
        image
    );
    let slot = |index: u64| {
        let bytes = space
            .read(IMPORT_FIXTURE_BASE + 0x1160 + 8 * index, 8)
            .expect("address table is mapped");
        u64::from_le_bytes(bytes.try_into().expect("8 bytes"))
    };
    let chkstk = slot(0);
    let bug_check = slot(1);
    assert_eq!(image.end(), chkstk);
    assert_eq!(image.end() + STUB_SIZE, bug_check);
    assert_eq!(vec![0xC3], space.read(chkstk, 1).expect("stub is mapped"));
    assert_eq!(
        TRAP_STUB.to_vec(),
        space.read(bug_check, 2).expect("stub is mapped")
    );
    // the lookup table keeps pointing at the names
    assert_eq!(
        0x11A0u64.to_le_bytes().to_vec(),
        space
            .read(IMPORT_FIXTURE_BASE + 0x1140, 8)
            .expect("lookup table is mapped")
    );
}
