//! Typed errors for the hardware boundary.
//!
//! `Sensor`/`Effector` calls return `BoxError`. Actions pass those through
//! `map_hw_error` so a timeout stays distinguishable from other device
//! failures all the way up to the caller.

use crate::error::CalibrationError;

/// Map a trait-boundary error to a typed `CalibrationError`.
///
/// `evolver_hardware::HwError` is matched exactly when the `hardware-errors`
/// feature is on; any other error is classified by its message.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> CalibrationError {
    #[cfg(feature = "hardware-errors")]
    {
        use evolver_hardware::error::HwError;

        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => CalibrationError::Timeout,
                HwError::ChannelOutOfRange { channel, channels } => CalibrationError::Hardware(
                    format!("channel {channel} is not wired ({channels} channels available)"),
                ),
                HwError::Fault(msg) => CalibrationError::Hardware(msg.clone()),
                HwError::Io(io) => CalibrationError::Hardware(format!("device io: {io}")),
            };
        }
    }

    let s = e.to_string();
    let lower = s.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        CalibrationError::Timeout
    } else {
        CalibrationError::Hardware(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_errors_fall_back_to_heuristics() {
        let e: evolver_traits::BoxError = "serial timeout on vial 3".into();
        assert_eq!(map_hw_error(e.as_ref()), CalibrationError::Timeout);

        let e: evolver_traits::BoxError = "read timed out".into();
        assert_eq!(map_hw_error(e.as_ref()), CalibrationError::Timeout);

        let e: evolver_traits::BoxError = "bus error".into();
        assert_eq!(
            map_hw_error(e.as_ref()),
            CalibrationError::Hardware("bus error".into())
        );
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hw_error_is_downcast() {
        use evolver_hardware::error::HwError;

        let e: evolver_traits::BoxError = Box::new(HwError::Timeout);
        assert_eq!(map_hw_error(e.as_ref()), CalibrationError::Timeout);

        let e: evolver_traits::BoxError = Box::new(HwError::ChannelOutOfRange {
            channel: 9,
            channels: 4,
        });
        assert_eq!(
            map_hw_error(e.as_ref()),
            CalibrationError::Hardware("channel 9 is not wired (4 channels available)".into())
        );

        let e: evolver_traits::BoxError = Box::new(HwError::Fault("lamp failure".into()));
        assert_eq!(
            map_hw_error(e.as_ref()),
            CalibrationError::Hardware("lamp failure".into())
        );
    }
}
