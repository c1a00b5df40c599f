//! Locates the vault routine of a loaded module through its signature catalog, fills in
//! the request record it consumes and runs it in a sandbox to obtain the secret.

pub mod catalog;
pub mod driver;
pub mod extractor;
pub mod record;
pub mod resolver;
pub mod scanner;

use catalog::SignatureCatalog;
use driver::{InvocationLayout, LicensePayload, RoutineWindow};
use extractor::Secret;
use log::debug;
use record::RecordInputs;
use vault_commons::{
    records::{RecordPoint, Recorder},
    VaultResult,
};
use vault_machine::function_driver::ExecutionEnvironment;

/// Caller supplied inputs of one extraction, validated by [`Extractor::run`]
#[derive(Clone, Copy, Debug)]
pub struct ExtractionInputs<'a> {
    pub license: &'a [u8],
    pub smbios: &'a [u8],
    pub drive_serial: &'a [u8],
}

pub struct Extractor<'c> {
    catalog: &'c SignatureCatalog,
    layout: InvocationLayout,
}

impl<'c> Extractor<'c> {
    pub fn new(catalog: &'c SignatureCatalog) -> Self {
        Extractor {
            catalog,
            layout: InvocationLayout::default(),
        }
    }

    pub fn with_layout(catalog: &'c SignatureCatalog, layout: InvocationLayout) -> Self {
        Extractor { catalog, layout }
    }

    /// Full pipeline: locate routine and record, populate the record, invoke the routine
    /// and read back the secret.
    pub fn run(
        &self,
        environment: &mut dyn ExecutionEnvironment,
        inputs: &ExtractionInputs,
    ) -> VaultResult<Secret> {
        let payload = LicensePayload::new(inputs.license)?;
        let mut recorder = Recorder::new();
        recorder.record(RecordPoint::Arrival)?;

        let window = self.catalog.scan_window(environment.image());
        debug!(
            "catalog `{}`, scanning {:#x}..{:#x}",
            self.catalog.name, window.begin, window.end
        );
        let (routine_signature, entry) =
            scanner::locate(&*environment, &self.catalog.routine, window, "routine")?;
        let routine = RoutineWindow {
            entry,
            bound: routine_signature.size,
        };
        recorder.record(RecordPoint::RoutineLocated)?;

        let (reference, reference_address) = scanner::locate(
            &*environment,
            &self.catalog.request_reference,
            window,
            "request reference",
        )?;
        let record_base = resolver::resolve(&*environment, reference_address, reference.operand_offset)?;
        debug!(
            "request reference at {:#x}, record at {:#x}",
            reference_address, record_base
        );
        recorder.record(RecordPoint::RecordLocated)?;

        let writes = record::build(
            record_base,
            &RecordInputs::new(inputs.smbios, inputs.drive_serial),
        );
        recorder.record(RecordPoint::RecordBuilt)?;

        recorder.record(RecordPoint::InvocationStart)?;
        let invocation = driver::invoke(environment, routine, &writes, &payload, &self.layout)?;
        debug!(
            "routine returned after {} instructions",
            invocation.outcome.instructions
        );
        recorder.record(RecordPoint::InvocationEnd)?;

        let secret = extractor::extract(&*environment, invocation.secret_buffer);
        invocation.release(environment);
        let secret = secret?;
        recorder.record(RecordPoint::SecretExtracted)?;
        debug!("extraction phases:\n{}", recorder.get_summary());
        Ok(secret)
    }
}
