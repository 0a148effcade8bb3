//! Input pre-validation and post-transform verification.
//!
//! Pre-validation is cheap and header-only; it runs before any cache lookup.
//! Double verification decodes and analyzes the optimized bytes, re-encodes
//! them, and enforces the expansion-ratio guard. Any failure means the caller
//! gets the original bytes.

use crate::analyzer;
use crate::config::LimitsConfig;
use crate::error::{Rejection, UnitError, VerifyError};
use crate::sandbox::SandboxContext;
use crate::unit::codec::{self, UnitHeader};
use crate::unit::{UnitIr, UNIT_HEADER_SIZE};

#[derive(Debug, Clone)]
pub struct IntegrityGate {
    limits: LimitsConfig,
}

impl IntegrityGate {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Magic, size and version checks on raw input.
    pub fn pre_validate(&self, bytes: &[u8]) -> Result<UnitHeader, Rejection> {
        let min = self.limits.min_unit_size.max(UNIT_HEADER_SIZE);
        if bytes.len() < min {
            return Err(Rejection::TooSmall {
                len: bytes.len(),
                min,
            });
        }
        if bytes.len() > self.limits.max_unit_size {
            return Err(Rejection::TooLarge {
                len: bytes.len(),
                max: self.limits.max_unit_size,
            });
        }
        let header = codec::read_header(bytes).map_err(|err| match err {
            UnitError::TooShort { len } => Rejection::TooSmall { len, min },
            _ => Rejection::BadMagic,
        })?;
        if header.version < self.limits.min_version || header.version > self.limits.max_version {
            return Err(Rejection::UnsupportedVersion {
                version: header.version,
            });
        }
        Ok(header)
    }

    /// Structural check, round-trip check and expansion guard.
    ///
    /// Returns the decoded optimized unit on success.
    pub fn double_verify(
        &self,
        original: &[u8],
        optimized: &[u8],
        sandbox: &mut SandboxContext,
    ) -> Result<UnitIr, VerifyError> {
        let unit = codec::decode(optimized)?;
        let analysis = analyzer::analyze(&unit, sandbox)?;
        if u32::from(unit.max_stack) < analysis.max_stack {
            return Err(VerifyError::RoundTrip(format!(
                "declared max_stack {} below analyzed depth {}",
                unit.max_stack, analysis.max_stack
            )));
        }

        let reencoded = codec::encode(&unit)
            .map_err(|err| VerifyError::RoundTrip(format!("re-encode failed: {err}")))?;
        if reencoded.len() != optimized.len() {
            return Err(VerifyError::RoundTrip(format!(
                "re-encoded {} bytes, expected {}",
                reencoded.len(),
                optimized.len()
            )));
        }
        if reencoded != optimized {
            return Err(VerifyError::RoundTrip("re-encoded bytes differ".to_string()));
        }

        self.check_expansion(original.len(), optimized.len())?;
        Ok(unit)
    }

    /// Reject outputs larger than `original * max_expansion_ratio`.
    pub fn check_expansion(&self, original: usize, optimized: usize) -> Result<(), VerifyError> {
        if original == 0 {
            return Ok(());
        }
        #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
        let ratio = optimized as f64 / original as f64;
        if ratio > self.limits.max_expansion_ratio {
            return Err(VerifyError::Expansion {
                original,
                optimized,
                ratio,
                max: self.limits.max_expansion_ratio,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{BinOp, Insn};

    fn gate() -> IntegrityGate {
        IntegrityGate::new(LimitsConfig::default())
    }

    fn sandbox() -> SandboxContext {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("t", Default::default(), None);
        sandbox
    }

    fn add_bytes() -> Vec<u8> {
        let mut unit = UnitIr::new(0);
        unit.max_stack = 2;
        unit.code = vec![
            Insn::Const(2),
            Insn::Const(3),
            Insn::Binary(BinOp::Add),
            Insn::Return,
        ];
        codec::encode(&unit).unwrap()
    }

    #[test]
    fn pre_validate_accepts_well_formed_header() {
        let header = gate().pre_validate(&add_bytes()).unwrap();
        assert_eq!(header.version, 1);
    }

    #[test]
    fn pre_validate_rejects_bad_inputs() {
        let gate = gate();
        assert!(matches!(gate.pre_validate(b"BUNT"), Err(Rejection::TooSmall { .. })));

        let mut bytes = add_bytes();
        bytes[0] = b'X';
        assert_eq!(gate.pre_validate(&bytes), Err(Rejection::BadMagic));

        let mut bytes = add_bytes();
        bytes[4] = 9;
        assert_eq!(
            gate.pre_validate(&bytes),
            Err(Rejection::UnsupportedVersion { version: 9 })
        );

        let huge = vec![0u8; (1 << 20) + 1];
        assert!(matches!(gate.pre_validate(&huge), Err(Rejection::TooLarge { .. })));
    }

    #[test]
    fn double_verify_accepts_valid_output() {
        let bytes = add_bytes();
        let unit = gate().double_verify(&bytes, &bytes, &mut sandbox()).unwrap();
        assert_eq!(unit.code.len(), 4);
    }

    #[test]
    fn double_verify_rejects_structural_damage() {
        let mut unit = UnitIr::new(0);
        unit.code = vec![Insn::Goto(5)];
        let bad = codec::encode(&unit).unwrap();
        let err = gate().double_verify(&add_bytes(), &bad, &mut sandbox()).unwrap_err();
        assert!(matches!(err, VerifyError::Structure(_)));

        let truncated = &add_bytes()[..30];
        let err = gate().double_verify(&add_bytes(), truncated, &mut sandbox()).unwrap_err();
        assert!(matches!(err, VerifyError::Decode(_)));
    }

    #[test]
    fn double_verify_rejects_understated_max_stack() {
        let mut unit = codec::decode(&add_bytes()).unwrap();
        unit.max_stack = 1;
        let bytes = codec::encode(&unit).unwrap();
        let err = gate().double_verify(&bytes, &bytes, &mut sandbox()).unwrap_err();
        assert!(matches!(err, VerifyError::RoundTrip(_)));
    }

    #[test]
    fn expansion_guard() {
        let gate = gate();
        assert!(gate.check_expansion(100, 300).is_ok());
        let err = gate.check_expansion(100, 301).unwrap_err();
        assert!(matches!(err, VerifyError::Expansion { original: 100, optimized: 301, .. }));
    }
}
