use crate::catalog::{Signature, Window};
use itertools::Itertools;
use log::{debug, warn};
use vault_commons::{VaultError, VaultResult};
use vault_machine::function_driver::ExecutionEnvironment;

/// Matches of a single pattern inside the window, in ascending order.
/// The sequence is lazy and calling it again restarts the search.
pub fn scan<'a>(
    environment: &'a dyn ExecutionEnvironment,
    pattern: &'a [u8],
    window: Window,
) -> Box<dyn Iterator<Item = u64> + 'a> {
    environment.search(pattern, window.begin, window.end)
}

/// Walks the prioritized signature list and returns the first signature that matches
/// exactly once, together with its match address.
/// Signatures without a match fall through to the next one, ambiguous signatures are
/// reported and skipped. When no signature is usable the failure reflects the outcome
/// of the last signature in the list.
pub fn locate<'s, S: Signature>(
    environment: &dyn ExecutionEnvironment,
    signatures: &'s [S],
    window: Window,
    what: &str,
) -> VaultResult<(&'s S, u64)> {
    // outcome of the signature tried last, candidates when it was ambiguous
    let mut ambiguous: Option<Vec<u64>> = None;
    for (priority, signature) in signatures.iter().enumerate() {
        // two matches are enough to know the signature is unusable
        let mut matches = scan(environment, signature.pattern(), window);
        let first = match matches.next() {
            Some(address) => address,
            None => {
                debug!("{} signature {} has no match", what, priority);
                ambiguous = None;
                continue;
            }
        };
        match matches.next() {
            None => {
                debug!("{} signature {} matched at {:#x}", what, priority, first);
                return Ok((signature, first));
            }
            Some(second) => {
                let candidates: Vec<u64> = [first, second]
                    .into_iter()
                    .chain(scan(environment, signature.pattern(), window).skip(2))
                    .collect();
                warn!(
                    "{} signature {} is ambiguous, matches at {}",
                    what,
                    priority,
                    candidates
                        .iter()
                        .map(|address| format!("{:#x}", address))
                        .join(", ")
                );
                ambiguous = Some(candidates);
            }
        }
    }
    match ambiguous {
        Some(candidates) => Err(VaultError::LocatorAmbiguous {
            what: what.to_string(),
            candidates,
        }),
        None => Err(VaultError::LocatorNotFound {
            what: what.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ReferenceSignature;
    use vault_machine::{machine_config::MachineConfig, function_driver::compute_driver::interpreter::InterpreterEnvironment};

    const BASE: u64 = 0x1_C000_0000;

    fn environment(image: &[u8]) -> InterpreterEnvironment {
        let config = MachineConfig {
            raw_image_base: BASE,
            ..MachineConfig::default()
        };
        InterpreterEnvironment::from_bytes(image, &config).expect("raw image loads")
    }

    fn signature(pattern: &[u8]) -> ReferenceSignature {
        ReferenceSignature {
            pattern: pattern.to_vec(),
            operand_offset: 0,
        }
    }

    fn image_window(env: &InterpreterEnvironment) -> Window {
        Window::from(env.image())
    }

    #[test_log::test]
    fn scan_is_restartable_and_ordered() {
        let mut image = vec![0u8; 0x100];
        image[0x10..0x13].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        image[0x80..0x83].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        let env = environment(&image);
        let window = image_window(&env);
        let pattern = [0xAA, 0xBB, 0xCC];
        let first: Vec<u64> = scan(&env, &pattern, window).collect();
        let second: Vec<u64> = scan(&env, &pattern, window).collect();
        assert_eq!(vec![BASE + 0x10, BASE + 0x80], first);
        assert_eq!(first, second);
    }

    #[test_log::test]
    fn scan_respects_window() {
        let mut image = vec![0u8; 0x100];
        image[0x10..0x13].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        image[0x80..0x83].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        let env = environment(&image);
        let pattern = [0xAA, 0xBB, 0xCC];
        let window = Window {
            begin: BASE + 0x11,
            end: BASE + 0x100,
        };
        assert_eq!(vec![BASE + 0x80], scan(&env, &pattern, window).collect::<Vec<_>>());
        // a match straddling the end of the window does not count
        let window = Window {
            begin: BASE,
            end: BASE + 0x82,
        };
        assert_eq!(vec![BASE + 0x10], scan(&env, &pattern, window).collect::<Vec<_>>());
    }

    #[test_log::test]
    fn unique_match_is_accepted() {
        let mut image = vec![0u8; 0x100];
        image[0x40..0x44].copy_from_slice(&[1, 2, 3, 4]);
        let env = environment(&image);
        let signatures = [signature(&[1, 2, 3, 4])];
        let (found, address) =
            locate(&env, &signatures, image_window(&env), "test").expect("unique match");
        assert_eq!(&signatures[0], found);
        assert_eq!(BASE + 0x40, address);
    }

    #[test_log::test]
    fn missing_pattern_is_not_found() {
        let env = environment(&[0u8; 0x100]);
        let signatures = [signature(&[1, 2, 3, 4]), signature(&[5, 6])];
        match locate(&env, &signatures, image_window(&env), "test") {
            Err(VaultError::LocatorNotFound { what }) => assert_eq!("test", what),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[test_log::test]
    fn ambiguous_pattern_without_fallback_fails() {
        let mut image = vec![0u8; 0x100];
        image[0x10..0x12].copy_from_slice(&[7, 8]);
        image[0x20..0x22].copy_from_slice(&[7, 8]);
        image[0x30..0x32].copy_from_slice(&[7, 8]);
        let env = environment(&image);
        let signatures = [signature(&[7, 8])];
        match locate(&env, &signatures, image_window(&env), "test") {
            Err(VaultError::LocatorAmbiguous { candidates, .. }) => {
                assert_eq!(vec![BASE + 0x10, BASE + 0x20, BASE + 0x30], candidates)
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
    }

    #[test_log::test]
    fn falls_back_past_missing_and_ambiguous_signatures() {
        let mut image = vec![0u8; 0x100];
        image[0x10..0x12].copy_from_slice(&[7, 8]);
        image[0x20..0x22].copy_from_slice(&[7, 8]);
        image[0x50..0x53].copy_from_slice(&[9, 9, 1]);
        let env = environment(&image);
        let signatures = [
            signature(&[1, 2, 3, 4]),
            signature(&[7, 8]),
            signature(&[9, 9, 1]),
        ];
        let (found, address) = locate(&env, &signatures, image_window(&env), "test")
            .expect("third signature is unique");
        assert_eq!(&signatures[2], found);
        assert_eq!(BASE + 0x50, address);
    }

    #[test_log::test]
    fn miss_of_the_last_signature_is_not_found() {
        let mut image = vec![0u8; 0x100];
        image[0x10..0x12].copy_from_slice(&[7, 8]);
        image[0x20..0x22].copy_from_slice(&[7, 8]);
        let env = environment(&image);
        let signatures = [signature(&[7, 8]), signature(&[1, 2, 3, 4])];
        match locate(&env, &signatures, image_window(&env), "test") {
            Err(VaultError::LocatorNotFound { what }) => assert_eq!("test", what),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[test_log::test]
    fn ambiguity_of_the_last_signature_is_reported() {
        let mut image = vec![0u8; 0x100];
        image[0x10..0x12].copy_from_slice(&[7, 8]);
        image[0x20..0x22].copy_from_slice(&[7, 8]);
        let env = environment(&image);
        let signatures = [signature(&[1, 2, 3, 4]), signature(&[7, 8])];
        match locate(&env, &signatures, image_window(&env), "test") {
            Err(VaultError::LocatorAmbiguous { candidates, .. }) => {
                assert_eq!(vec![BASE + 0x10, BASE + 0x20], candidates)
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
    }
}
