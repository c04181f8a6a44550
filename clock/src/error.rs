#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClockError {
    #[error("Reference frequency {0}Hz is not usable")]
    InvalidReference(f64),

    #[error("Requested frequency {0}Hz is not usable")]
    InvalidFrequency(f64),

    #[error("Requested frequency {0}Hz is too low, even with the maximum R divider")]
    FrequencyTooLow(f64),

    #[error("Invalid {stage} divider: {value}")]
    InvalidDivider { stage: &'static str, value: u32 },
}
