use crate::types::RawSample;

// Echo width per centimeter of range, round trip at room temperature.
pub const US_ROUNDTRIP_CM: u32 = 57;

pub trait DistanceSensor {
    fn sample(&mut self) -> RawSample;
}

impl<T: DistanceSensor + ?Sized> DistanceSensor for &mut T {
    fn sample(&mut self) -> RawSample {
        (**self).sample()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoTiming {
    max_distance_cm: u16,
}

impl EchoTiming {
    pub fn new(max_distance_cm: u16) -> Self {
        Self { max_distance_cm }
    }

    pub fn max_distance_cm(&self) -> u16 {
        self.max_distance_cm
    }

    pub fn max_echo_us(&self) -> u32 {
        (u32::from(self.max_distance_cm) + 1) * US_ROUNDTRIP_CM
    }

    pub fn from_echo_us(&self, echo_us: Option<u32>) -> RawSample {
        let Some(echo_us) = echo_us else {
            return RawSample::NoEcho;
        };
        if echo_us > self.max_echo_us() {
            return RawSample::NoEcho;
        }

        let cm = (echo_us + US_ROUNDTRIP_CM / 2) / US_ROUNDTRIP_CM;
        if cm > u32::from(self.max_distance_cm) {
            RawSample::NoEcho
        } else {
            RawSample::Distance(cm as u16)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_round_trip_time_to_centimeters() {
        let timing = EchoTiming::new(400);

        assert_eq!(timing.from_echo_us(Some(3_420)), RawSample::Distance(60));
        // 28 µs rounds down, 29 µs rounds up.
        assert_eq!(timing.from_echo_us(Some(28)), RawSample::Distance(0));
        assert_eq!(timing.from_echo_us(Some(29)), RawSample::Distance(1));
    }

    #[test]
    fn missing_or_late_echo_is_no_echo() {
        let timing = EchoTiming::new(400);

        assert_eq!(timing.from_echo_us(None), RawSample::NoEcho);
        assert_eq!(timing.max_echo_us(), 401 * 57);
        assert_eq!(
            timing.from_echo_us(Some(timing.max_echo_us() + 1)),
            RawSample::NoEcho
        );
        // 400.5 cm rounds to 401, which is past the configured range.
        assert_eq!(timing.from_echo_us(Some(400 * 57 + 40)), RawSample::NoEcho);
        assert_eq!(timing.from_echo_us(Some(400 * 57)), RawSample::Distance(400));
    }
}
