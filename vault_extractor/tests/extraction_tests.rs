use vault_commons::{FaultKind, VaultError};
use vault_extractor::{
    catalog::SignatureCatalog,
    extractor::Secret,
    record::{DEBUGGER_ATTACHED_OFFSET, DEBUGGER_ENABLED_OFFSET, DRIVE_SERIAL_OFFSET, SMBIOS_OFFSET},
    ExtractionInputs, Extractor,
};
use vault_machine::{
    function_driver::{compute_driver::interpreter::InterpreterEnvironment, ExecutionEnvironment},
    machine_config::MachineConfig,
};

mod fixture {
    pub const BASE: u64 = 0x1_C000_0000;
    pub const IMAGE_SIZE: usize = 0x1000;
    pub const RECORD: usize = 0x400;
    pub const SECRET: [u8; 16] = [
        0x3C, 0x91, 0x5E, 0x07, 0xA2, 0x44, 0xD8, 0x1B, 0x66, 0xF0, 0x2D, 0x83, 0x59, 0xCE,
        0x14, 0xB7,
    ];

    /// mov r11, rsp; mov [r11+8], rcx; movups xmm0, [rip+0xF2]; movups [r8], xmm0; ret
    const ROUTINE: [u8; 19] = [
        0x4C, 0x8B, 0xDC, 0x49, 0x89, 0x4B, 0x08, 0x0F, 0x10, 0x05, 0xF2, 0x00, 0x00, 0x00, 0x41,
        0x0F, 0x11, 0x00, 0xC3,
    ];
    const CONSTANT: usize = 0x100;
    pub const REFERENCE: usize = 0x200;
    /// mov byte [rbp], 0x19; mov al, [rbp]; lea rcx, [rip+0x1F2]
    const REFERENCE_CODE: [u8; 14] = [
        0xC6, 0x45, 0x00, 0x19, 0x8A, 0x45, 0x00, 0x48, 0x8D, 0x0D, 0xF2, 0x01, 0x00, 0x00,
    ];

    pub fn image() -> Vec<u8> {
        let mut image = vec![0u8; IMAGE_SIZE];
        image[..ROUTINE.len()].copy_from_slice(&ROUTINE);
        image[CONSTANT..CONSTANT + 16].copy_from_slice(&SECRET);
        image[REFERENCE..REFERENCE + REFERENCE_CODE.len()].copy_from_slice(&REFERENCE_CODE);
        image
    }

    pub const HELPER: usize = 0xA00;
    /// mov r11, rsp; mov [r11+8], rcx; call HELPER; ret
    const SHORT_ROUTINE: [u8; 13] = [
        0x4C, 0x8B, 0xDC, 0x49, 0x89, 0x4B, 0x08, 0xE8, 0xF4, 0x09, 0x00, 0x00, 0xC3,
    ];
    /// movups xmm0, [rip-0x907]; movups [r8], xmm0; ret
    const HELPER_CODE: [u8; 12] = [
        0x0F, 0x10, 0x05, 0xF9, 0xF6, 0xFF, 0xFF, 0x41, 0x0F, 0x11, 0x00, 0xC3,
    ];

    /// Routine whose window only covers a call into a helper placed behind the record.
    pub fn image_with_helper() -> Vec<u8> {
        let mut image = image();
        image[..ROUTINE.len()].fill(0);
        image[..SHORT_ROUTINE.len()].copy_from_slice(&SHORT_ROUTINE);
        image[HELPER..HELPER + HELPER_CODE.len()].copy_from_slice(&HELPER_CODE);
        image
    }

    pub const SHORT_CATALOG: &str = r#"{
        "routine": [ { "pattern": "4c 8b dc 49 89 4b 08", "size": 13 } ],
        "request_reference": [ { "pattern": "c6 45 00 19 8a 45 00", "operand_offset": 10 } ]
    }"#;

    pub fn duplicate_reference(image: &mut [u8], at: usize) {
        image[at..at + REFERENCE_CODE.len()].copy_from_slice(&REFERENCE_CODE);
    }

    pub const CATALOG: &str = r#"{
        "name": "fixture",
        "routine": [ { "pattern": "4c 8b dc 49 89 4b 08", "size": "0x40" } ],
        "request_reference": [ { "pattern": "c6 45 00 19 8a 45 00", "operand_offset": 10 } ]
    }"#;
}

fn environment(image: &[u8]) -> InterpreterEnvironment {
    let config = MachineConfig {
        raw_image_base: fixture::BASE,
        ..MachineConfig::default()
    };
    InterpreterEnvironment::from_bytes(image, &config).expect("fixture image loads")
}

fn catalog(json: &str) -> SignatureCatalog {
    SignatureCatalog::from_json(json.as_bytes()).expect("fixture catalog is valid")
}

const SMBIOS: [u8; 8] = [0x01, 0x1B, 0x01, 0x00, 0x01, 0x02, 0x03, 0x04];
const DRIVE_SERIAL: [u8; 4] = *b"WD-1";

fn run(image: &[u8], catalog: &SignatureCatalog, license: &[u8]) -> Result<Secret, VaultError> {
    let mut env = environment(image);
    let inputs = ExtractionInputs {
        license,
        smbios: &SMBIOS,
        drive_serial: &DRIVE_SERIAL,
    };
    Extractor::new(catalog).run(&mut env, &inputs)
}

#[test_log::test]
fn end_to_end_returns_stub_secret() {
    let catalog = catalog(fixture::CATALOG);
    let secret = run(&fixture::image(), &catalog, &[0u8; 4094]).expect("extraction succeeds");
    assert_eq!(fixture::SECRET, *secret.as_bytes());
}

#[test_log::test]
fn record_is_populated_before_the_run() {
    let catalog = catalog(fixture::CATALOG);
    let mut env = environment(&fixture::image());
    let inputs = ExtractionInputs {
        license: &[0u8; 4094],
        smbios: &SMBIOS,
        drive_serial: &DRIVE_SERIAL,
    };
    Extractor::new(&catalog)
        .run(&mut env, &inputs)
        .expect("extraction succeeds");
    let record = fixture::BASE + fixture::RECORD as u64;
    let read = |offset: u64, length: usize| {
        env.read(record + offset, length)
            .expect("record lies inside the image")
    };
    assert_eq!(vec![4, 0, 0, 0], read(0, 4));
    assert_eq!(SMBIOS.to_vec(), read(SMBIOS_OFFSET, 8));
    // rest of the smbios field stays untouched
    assert_eq!(vec![0u8; 248], read(SMBIOS_OFFSET + 8, 248));
    assert_eq!(DRIVE_SERIAL.to_vec(), read(DRIVE_SERIAL_OFFSET, 4));
    assert_eq!(vec![0xD4, 0x02, 0xFE, 0x7F], read(DEBUGGER_ENABLED_OFFSET, 4));
    assert_eq!(vec![0xD4, 0x02, 0xFE, 0x7F], read(DEBUGGER_ATTACHED_OFFSET, 4));
    assert_eq!(
        vec![0x10, 0, 0, 0],
        env.read(0x7FFE_02D4, 4).expect("debugger cell is mapped")
    );
}

#[test]
fn license_length_is_checked_first() {
    // a catalog that matches nothing would fail later with a locator error
    let catalog = catalog(
        r#"{"routine": [{"pattern": "ff ee dd", "size": 16}],
            "request_reference": [{"pattern": "ff ee dd", "operand_offset": 3}]}"#,
    );
    for length in [4093, 4095] {
        match run(&fixture::image(), &catalog, &vec![0u8; length]) {
            Err(VaultError::InputLengthMismatch { expected, actual }) => {
                assert_eq!(4094, expected);
                assert_eq!(length, actual);
            }
            other => panic!("expected length mismatch, got {:?}", other),
        }
    }
}

#[test_log::test]
fn unknown_module_version_is_not_found() {
    let catalog = catalog(
        r#"{"routine": [{"pattern": "48 89 5c 24 08", "size": 64}],
            "request_reference": [{"pattern": "c6 45 00 19 8a 45 00", "operand_offset": 10}]}"#,
    );
    match run(&fixture::image(), &catalog, &[0u8; 4094]) {
        Err(VaultError::LocatorNotFound { what }) => assert_eq!("routine", what),
        other => panic!("expected routine not found, got {:?}", other),
    }
}

#[test_log::test]
fn duplicated_reference_is_ambiguous() {
    let catalog = catalog(fixture::CATALOG);
    let mut image = fixture::image();
    fixture::duplicate_reference(&mut image, 0x300);
    match run(&image, &catalog, &[0u8; 4094]) {
        Err(VaultError::LocatorAmbiguous { what, candidates }) => {
            assert_eq!("request reference", what);
            assert_eq!(
                vec![
                    fixture::BASE + fixture::REFERENCE as u64,
                    fixture::BASE + 0x300
                ],
                candidates
            );
        }
        other => panic!("expected ambiguous reference, got {:?}", other),
    }
}

#[test_log::test]
fn fallback_signature_is_used() {
    // the first entry is ambiguous, the second absent and the third unique
    let catalog = catalog(
        r#"{"routine": [
                {"pattern": "aa bb cc dd", "size": 64},
                {"pattern": "4c 8b dc 49 89 4b 08", "size": 64}
            ],
            "request_reference": [
                {"pattern": "00 00 00 00 00 00 00 00", "operand_offset": 0},
                {"pattern": "90 90 90 90", "operand_offset": 4},
                {"pattern": "8a 45 00 48 8d 0d", "operand_offset": 6}
            ]}"#,
    );
    let secret = run(&fixture::image(), &catalog, &[0u8; 4094]).expect("fallbacks resolve");
    assert_eq!(fixture::SECRET, *secret.as_bytes());
}

#[test_log::test]
fn window_excluding_the_routine_is_not_found() {
    let catalog = catalog(
        r#"{"window": {"begin": "0x1c0000100", "end": "0x1c0001000"},
            "routine": [{"pattern": "4c 8b dc 49 89 4b 08", "size": 64}],
            "request_reference": [{"pattern": "c6 45 00 19 8a 45 00", "operand_offset": 10}]}"#,
    );
    match run(&fixture::image(), &catalog, &[0u8; 4094]) {
        Err(VaultError::LocatorNotFound { what }) => assert_eq!("routine", what),
        other => panic!("expected routine not found, got {:?}", other),
    }
}

#[test_log::test]
fn sandbox_fault_is_distinct_from_locator_errors() {
    let catalog = catalog(fixture::CATALOG);
    let mut image = fixture::image();
    // replace the final ret with a read of address zero
    image[18..26].copy_from_slice(&[0x48, 0x8B, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00]);
    match run(&image, &catalog, &[0u8; 4094]) {
        Err(VaultError::ExecutionFault(FaultKind::InvalidRead(0))) => (),
        other => panic!("expected invalid read, got {:?}", other),
    }
}

#[test_log::test]
fn helper_outside_the_routine_window_is_followed() {
    let catalog = catalog(fixture::SHORT_CATALOG);
    let secret = run(&fixture::image_with_helper(), &catalog, &[0u8; 4094])
        .expect("routine returns through its helper");
    assert_eq!(fixture::SECRET, *secret.as_bytes());
}

#[test_log::test]
fn serial_field_tail_is_left_untouched() {
    let catalog = catalog(fixture::CATALOG);
    let mut image = fixture::image();
    let serial_field = fixture::RECORD + DRIVE_SERIAL_OFFSET as usize;
    image[serial_field..serial_field + 64].fill(0xEE);
    let mut env = environment(&image);
    let inputs = ExtractionInputs {
        license: &[0u8; 4094],
        smbios: &SMBIOS,
        drive_serial: &DRIVE_SERIAL,
    };
    Extractor::new(&catalog)
        .run(&mut env, &inputs)
        .expect("extraction succeeds");
    let field = env
        .read(fixture::BASE + serial_field as u64, 64)
        .expect("record lies inside the image");
    assert_eq!(&DRIVE_SERIAL[..], &field[..4]);
    assert_eq!(vec![0xEE; 60], field[4..].to_vec());
}
