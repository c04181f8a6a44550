//! Register image for the Si5351 clock synthesizer feeding the converters.
//!
//! The sample clock is produced by driving PLL A from the reference through
//! a fractional feedback multisynth (MSNA), and dividing the VCO down to the
//! output through an even integer multisynth (MS0) and the R divider.
use crate::error::ClockError;
use crate::rational::{rational_approximation, Rational};
use log::{debug, warn};

pub const MAX_VCO_FREQUENCY: f64 = 900e6;
pub const MAX_DENOMINATOR: u32 = 1_048_575;
pub const MIN_OUTPUT_FREQUENCY: f64 = 1e6;
pub const MAX_RDIV: u8 = 7;

/// Maximum relative deviation between requested and achieved frequency
/// before a precision warning is raised.
pub const FREQUENCY_TOLERANCE: f64 = 1e-8;

pub const REGISTER_CLK0_CONTROL: u8 = 16;
pub const REGISTER_MSNA_BASE: u8 = 26;
pub const REGISTER_MS0_BASE: u8 = 42;
pub const REGISTER_PLL_RESET: u8 = 177;

const PLL_RESET_PLLA: u8 = 0x20;
const CLK0_POWER_ON: u8 = 0x4f;
const MS_DIVBY4: u8 = 0x0c;

const MIN_OUTPUT_DIVIDER: u32 = 4;
// P1 is an 18-bit register field.
const MAX_P1: u32 = 0x3ffff;
const MAX_OUTPUT_DIVIDER: u32 = 900;

/// The three encoded parameters of a multisynth divider `a + b/c`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Multisynth {
    pub p1: u32,
    pub p2: u32,
    pub p3: u32,
}

impl Multisynth {
    pub fn from_ratio(ratio: Rational) -> Option<Multisynth> {
        let Rational {
            integer: a,
            numerator: b,
            denominator: c,
        } = ratio;

        if c == 0 || c > MAX_DENOMINATOR || b > c {
            return None;
        }

        let b_over_c = 128u32.checked_mul(b)? / c;
        let p1 = 128u32
            .checked_mul(a)?
            .checked_add(b_over_c)?
            .checked_sub(512)?;
        if p1 > MAX_P1 {
            return None;
        }
        let p2 = (128 * b).checked_sub(c.checked_mul(b_over_c)?)?;
        Some(Multisynth { p1, p2, p3: c })
    }

    /// Recovers `a + b/c` from the encoded parameters.
    pub fn ratio(&self) -> Rational {
        let scaled = self.p1 + 512;
        let b_over_c = scaled % 128;
        Rational {
            integer: scaled / 128,
            numerator: (self.p2 + self.p3 * b_over_c) / 128,
            denominator: self.p3,
        }
    }

    /// Packs into the 8 consecutive registers of a multisynth block. `flags`
    /// occupies the upper six bits of the third register.
    pub fn to_registers(&self, flags: u8) -> [u8; 8] {
        let (p1, p2, p3) = (self.p1, self.p2, self.p3);
        [
            ((p3 & 0x0000ff00) >> 8) as u8,
            (p3 & 0x000000ff) as u8,
            (flags & 0xfc) | ((p1 & 0x00030000) >> 16) as u8,
            ((p1 & 0x0000ff00) >> 8) as u8,
            (p1 & 0x000000ff) as u8,
            (((p3 & 0x000f0000) >> 12) | ((p2 & 0x000f0000) >> 16)) as u8,
            ((p2 & 0x0000ff00) >> 8) as u8,
            (p2 & 0x000000ff) as u8,
        ]
    }

    pub fn from_registers(registers: &[u8; 8]) -> (Multisynth, u8) {
        let r = (*registers).map(u32::from);
        let multisynth = Multisynth {
            p1: ((r[2] & 0x03) << 16) | (r[3] << 8) | r[4],
            p2: ((r[5] & 0x0f) << 16) | (r[6] << 8) | r[7],
            p3: ((r[5] & 0xf0) << 12) | (r[0] << 8) | r[1],
        };
        (multisynth, registers[2] & 0xfc)
    }
}

/// A single I2C style register write: `data` lands at `base`, `base + 1`, ...
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterWrite {
    pub base: u8,
    pub data: Vec<u8>,
}

/// Anything that can write a run of synthesizer registers.
pub trait RegisterBus {
    type Error;

    fn write_registers(&mut self, base: u8, data: &[u8]) -> Result<(), Self::Error>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClockProgram {
    reference: f64,
    target: f64,
    feedback: Rational,
    output_divider: u32,
    rdiv: u8,
    achieved: f64,
    feedback_registers: [u8; 8],
    output_registers: [u8; 8],
}

impl ClockProgram {
    pub fn compute(reference: f64, frequency: f64) -> Result<ClockProgram, ClockError> {
        if !reference.is_finite() || reference <= 0.0 {
            return Err(ClockError::InvalidReference(reference));
        }
        if !frequency.is_finite() {
            return Err(ClockError::InvalidFrequency(frequency));
        }

        // Below 1MHz the multisynth can't run, so pre-scale with the R divider.
        let mut scaled = frequency;
        let mut rdiv = 0;
        while scaled < MIN_OUTPUT_FREQUENCY && rdiv < MAX_RDIV {
            scaled *= 2.0;
            rdiv += 1;
        }
        if scaled < MIN_OUTPUT_FREQUENCY {
            return Err(ClockError::FrequencyTooLow(frequency));
        }

        let mut output_divider = (MAX_VCO_FREQUENCY / scaled) as u32;
        output_divider -= output_divider % 2;
        if !(MIN_OUTPUT_DIVIDER..=MAX_OUTPUT_DIVIDER).contains(&output_divider) {
            return Err(ClockError::InvalidDivider {
                stage: "output",
                value: output_divider,
            });
        }

        let vco = scaled * output_divider as f64;
        let feedback = rational_approximation(vco / reference, MAX_DENOMINATOR);

        let achieved =
            reference * feedback.value() / output_divider as f64 / f64::from(1u32 << rdiv);
        let deviation = achieved - frequency;
        if (deviation / frequency).abs() >= FREQUENCY_TOLERANCE {
            warn!(
                "Clock deviates from the requested {}Hz by {}nHz",
                frequency,
                deviation * 1e9
            );
        }
        debug!(
            "Clock: a={} b={} c={} output_ms={} rdiv={}",
            feedback.integer, feedback.numerator, feedback.denominator, output_divider, rdiv
        );

        let feedback_ms = Multisynth::from_ratio(feedback).ok_or(ClockError::InvalidDivider {
            stage: "feedback",
            value: feedback.integer,
        })?;

        // The output divider is an even integer: a = output_ms, b = 0, c = 1
        let output_ms = Multisynth::from_ratio(Rational {
            integer: output_divider,
            numerator: 0,
            denominator: 1,
        })
        .ok_or(ClockError::InvalidDivider {
            stage: "output",
            value: output_divider,
        })?;

        let mut output_flags = rdiv << 4;
        if output_divider == 4 {
            output_flags |= MS_DIVBY4;
        }

        Ok(ClockProgram {
            reference,
            target: frequency,
            feedback,
            output_divider,
            rdiv,
            achieved,
            feedback_registers: feedback_ms.to_registers(0),
            output_registers: output_ms.to_registers(output_flags),
        })
    }

    pub fn reference(&self) -> f64 {
        self.reference
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn feedback(&self) -> Rational {
        self.feedback
    }

    pub fn output_divider(&self) -> u32 {
        self.output_divider
    }

    pub fn rdiv(&self) -> u8 {
        self.rdiv
    }

    pub fn achieved_frequency(&self) -> f64 {
        self.achieved
    }

    pub fn is_within_tolerance(&self) -> bool {
        ((self.achieved - self.target) / self.target).abs() < FREQUENCY_TOLERANCE
    }

    pub fn feedback_registers(&self) -> &[u8; 8] {
        &self.feedback_registers
    }

    pub fn output_registers(&self) -> &[u8; 8] {
        &self.output_registers
    }

    /// Register writes in the order the synthesizer needs them: PLL setup,
    /// output divider, PLL reset, then powering up the output.
    pub fn transactions(&self) -> [RegisterWrite; 4] {
        [
            RegisterWrite {
                base: REGISTER_MSNA_BASE,
                data: self.feedback_registers.to_vec(),
            },
            RegisterWrite {
                base: REGISTER_MS0_BASE,
                data: self.output_registers.to_vec(),
            },
            RegisterWrite {
                base: REGISTER_PLL_RESET,
                data: vec![PLL_RESET_PLLA],
            },
            RegisterWrite {
                base: REGISTER_CLK0_CONTROL,
                data: vec![CLK0_POWER_ON],
            },
        ]
    }

    /// Writes the program out, stopping at the first failure.
    pub fn apply<B: RegisterBus>(&self, bus: &mut B) -> Result<(), B::Error> {
        for write in self.transactions() {
            bus.write_registers(write.base, &write.data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[derive(Default)]
    struct RecordingBus {
        writes: Vec<(u8, Vec<u8>)>,
        fail_at: Option<usize>,
    }

    impl RegisterBus for RecordingBus {
        type Error = String;

        fn write_registers(&mut self, base: u8, data: &[u8]) -> Result<(), Self::Error> {
            if self.fail_at == Some(self.writes.len()) {
                return Err(format!("NAK at register {}", base));
            }
            self.writes.push((base, data.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn default_sample_rate_programs_cleanly() {
        let program = ClockProgram::compute(27_000_000.0, 32_000_000.0).unwrap();
        assert_eq!(program.rdiv(), 0);
        assert_eq!(program.output_divider() % 2, 0);
        assert!((4..=900).contains(&program.output_divider()));
        assert_eq!(program.output_divider(), 28);
        assert_eq!(
            program.feedback(),
            Rational {
                integer: 33,
                numerator: 5,
                denominator: 27
            }
        );
        assert!(program.is_within_tolerance());
        assert_relative_eq!(program.achieved_frequency(), 32e6, max_relative = 1e-12);
    }

    #[test]
    fn low_frequencies_use_the_r_divider() {
        for (frequency, expected_rdiv) in [
            (999_999.0, 1),
            (500_000.0, 1),
            (499_999.0, 2),
            (100_000.0, 4),
            (7_812.5, 7),
        ] {
            let program = ClockProgram::compute(27e6, frequency).unwrap();
            assert_eq!(program.rdiv(), expected_rdiv, "{}Hz", frequency);
            assert!(frequency * f64::from(1u32 << program.rdiv()) >= 1e6);
            let (_, flags) = Multisynth::from_registers(program.output_registers());
            assert_eq!((flags >> 4) & 0x07, expected_rdiv);
        }
    }

    #[test]
    fn frequencies_needing_more_than_seven_doublings_fail() {
        assert_eq!(
            ClockProgram::compute(27e6, 7_812.0),
            Err(ClockError::FrequencyTooLow(7_812.0))
        );
        assert!(ClockProgram::compute(27e6, 1_000.0).is_err());
    }

    #[test]
    fn too_high_frequencies_have_no_valid_divider() {
        let result = ClockProgram::compute(27e6, 300e6);
        assert_eq!(
            result,
            Err(ClockError::InvalidDivider {
                stage: "output",
                value: 2
            })
        );
    }

    #[test]
    fn registers_decode_to_the_encoded_values() {
        for (reference, frequency) in [
            (27e6, 32e6),
            (27e6 * (1.0 + 1e-6 * 12.5), 48e6),
            (25e6, 10e6),
            (27e6, 1.234_567e6),
            (27e6, 225e6),
        ] {
            let program = ClockProgram::compute(reference, frequency).unwrap();

            let (feedback, flags) = Multisynth::from_registers(program.feedback_registers());
            assert_eq!(flags, 0);
            assert_eq!(feedback.ratio(), program.feedback());

            let (output, flags) = Multisynth::from_registers(program.output_registers());
            let ratio = output.ratio();
            assert_eq!(ratio.integer, program.output_divider());
            assert_eq!((ratio.numerator, ratio.denominator), (0, 1));
            assert_eq!((flags >> 4) & 0x07, program.rdiv());
        }
    }

    #[test]
    fn divide_by_four_sets_the_divby4_bits() {
        let program = ClockProgram::compute(27e6, 225e6).unwrap();
        assert_eq!(program.output_divider(), 4);
        assert_eq!(program.output_registers()[2] & MS_DIVBY4, MS_DIVBY4);
    }

    #[test]
    fn unusable_references_are_rejected() {
        for reference in [0.0, -27e6, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ClockProgram::compute(reference, 32e6),
                Err(ClockError::InvalidReference(_))
            ));
        }
        assert!(matches!(
            ClockProgram::compute(27e6, f64::NAN),
            Err(ClockError::InvalidFrequency(_))
        ));
    }

    #[test]
    fn tiny_references_overflow_the_feedback_divider() {
        for reference in [1.0, 1_000.0] {
            assert!(matches!(
                ClockProgram::compute(reference, 32e6),
                Err(ClockError::InvalidDivider {
                    stage: "feedback",
                    ..
                })
            ));
        }
    }

    #[test]
    fn out_of_range_ratios_have_no_encoding() {
        let ratio = |integer, numerator, denominator| Rational {
            integer,
            numerator,
            denominator,
        };
        assert_eq!(Multisynth::from_ratio(ratio(u32::MAX, 0, 1)), None);
        assert_eq!(Multisynth::from_ratio(ratio(3, 0, 1)), None);
        assert_eq!(Multisynth::from_ratio(ratio(36, 1, 0)), None);
        assert_eq!(Multisynth::from_ratio(ratio(36, 5, 4)), None);
        assert!(Multisynth::from_ratio(ratio(2051, 0, 1)).is_some());
        assert_eq!(Multisynth::from_ratio(ratio(2052, 0, 1)), None);
    }

    #[test]
    fn large_denominators_survive_the_twenty_bit_split() {
        let multisynth = Multisynth::from_ratio(Rational {
            integer: 35,
            numerator: 1_000_001,
            denominator: 1_048_575,
        })
        .unwrap();
        let (decoded, _) = Multisynth::from_registers(&multisynth.to_registers(0));
        assert_eq!(decoded, multisynth);
        assert_eq!(decoded.p3, 1_048_575);
    }

    #[test]
    fn program_is_applied_in_order() {
        let program = ClockProgram::compute(27e6, 32e6).unwrap();
        let mut bus = RecordingBus::default();
        program.apply(&mut bus).unwrap();

        let bases: Vec<u8> = bus.writes.iter().map(|(base, _)| *base).collect();
        assert_eq!(
            bases,
            vec![
                REGISTER_MSNA_BASE,
                REGISTER_MS0_BASE,
                REGISTER_PLL_RESET,
                REGISTER_CLK0_CONTROL
            ]
        );
        assert_eq!(bus.writes[0].1, program.feedback_registers().to_vec());
        assert_eq!(bus.writes[2].1, vec![PLL_RESET_PLLA]);
        assert_eq!(bus.writes[3].1, vec![CLK0_POWER_ON]);
    }

    #[test]
    fn failed_write_aborts_the_sequence() {
        let program = ClockProgram::compute(27e6, 32e6).unwrap();
        let mut bus = RecordingBus {
            fail_at: Some(1),
            ..Default::default()
        };
        assert!(program.apply(&mut bus).is_err());
        assert_eq!(bus.writes.len(), 1);
    }
}
