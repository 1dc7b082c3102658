//! Precision and mixed-precision resolution.

use kiln_core::{KilnError, Precision, Result};

/// Where the computation runs, as far as precision is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeTarget {
    /// Host CPU.
    Cpu,
    /// One or more GPUs.
    Gpu,
    /// TPU cores.
    Tpu,
}

/// Resolved precision settings of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    precision: Precision,
    use_amp: bool,
}

impl PrecisionPolicy {
    /// Resolve `precision` for `target`.
    ///
    /// Half precision enables mixed precision on GPUs. TPUs run half
    /// precision natively, so mixed precision stays off there. CPUs cannot
    /// run mixed precision at all.
    pub fn resolve(precision: Precision, target: ComputeTarget) -> Result<Self> {
        let half = precision == Precision::Half;
        match target {
            ComputeTarget::Cpu if half => Err(KilnError::misconfigured(
                "precision",
                "amp + cpu is not supported. Please use a GPU option",
            )),
            ComputeTarget::Tpu => Ok(Self {
                precision,
                use_amp: false,
            }),
            _ => Ok(Self {
                precision,
                use_amp: half,
            }),
        }
    }

    /// Configured precision.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Whether mixed precision is active.
    pub fn use_amp(&self) -> bool {
        self.use_amp
    }

    /// Precision in bits.
    pub fn bits(&self) -> u32 {
        self.precision.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amp_on_cpu_rejected() {
        let err = PrecisionPolicy::resolve(Precision::Half, ComputeTarget::Cpu).unwrap_err();
        assert!(err.to_string().contains("amp + cpu is not supported"));
        let full = PrecisionPolicy::resolve(Precision::Full, ComputeTarget::Cpu).unwrap();
        assert!(!full.use_amp());
    }

    #[test]
    fn test_half_precision_targets() {
        assert!(PrecisionPolicy::resolve(Precision::Half, ComputeTarget::Gpu)
            .unwrap()
            .use_amp());
        let tpu = PrecisionPolicy::resolve(Precision::Half, ComputeTarget::Tpu).unwrap();
        assert!(!tpu.use_amp());
        assert_eq!(tpu.bits(), 16);
    }
}
