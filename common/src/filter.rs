use crate::{
    config::{NoEchoPolicy, WarmUp},
    types::RawSample,
};

#[derive(Debug, Clone)]
pub struct MovingAverage {
    slots: Vec<f32>,
    cursor: usize,
    filled: usize,
    sum: f32,
    no_echo: NoEchoPolicy,
    warm_up: WarmUp,
}

impl MovingAverage {
    pub fn new(window: usize, no_echo: NoEchoPolicy, warm_up: WarmUp) -> Self {
        Self {
            slots: vec![0.0; window.max(1)],
            cursor: 0,
            filled: 0,
            sum: 0.0,
            no_echo,
            warm_up,
        }
    }

    pub fn window(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn is_warm(&self) -> bool {
        self.filled == self.slots.len()
    }

    pub fn push(&mut self, sample: RawSample) -> f32 {
        let value = match (sample, self.no_echo) {
            (RawSample::Distance(cm), _) => f32::from(cm),
            (RawSample::NoEcho, NoEchoPolicy::Zero) => 0.0,
            (RawSample::NoEcho, NoEchoPolicy::Skip) => return self.average(),
        };

        self.sum -= self.slots[self.cursor];
        self.slots[self.cursor] = value;
        self.sum += value;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());

        // Float drift from the incremental sum stays tiny for whole-cm input,
        // but never report a negative distance.
        self.sum = self.sum.max(0.0);
        self.average()
    }

    pub fn average(&self) -> f32 {
        let divisor = match self.warm_up {
            WarmUp::ZeroPrimed => self.slots.len(),
            WarmUp::Partial if self.filled == 0 => return 0.0,
            WarmUp::Partial => self.filled,
        };
        self.sum / divisor as f32
    }

    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = 0.0);
        self.cursor = 0;
        self.filled = 0;
        self.sum = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(window: usize) -> MovingAverage {
        MovingAverage::new(window, NoEchoPolicy::Zero, WarmUp::Partial)
    }

    fn mean(values: &[u16]) -> f32 {
        values.iter().map(|v| f32::from(*v)).sum::<f32>() / values.len() as f32
    }

    #[test]
    fn cold_start_averages_samples_seen_so_far() {
        let mut filter = partial(10);
        let samples = [80_u16, 82, 79, 81];

        for (i, cm) in samples.iter().enumerate() {
            let avg = filter.push(RawSample::Distance(*cm));
            assert!((avg - mean(&samples[..=i])).abs() < 1e-4);
        }
        assert!(!filter.is_warm());
        assert_eq!(filter.len(), 4);
    }

    #[test]
    fn steady_state_tracks_last_window() {
        let mut filter = partial(5);
        let samples: Vec<u16> = (0..23).map(|i| 50 + (i * 7 % 13)).collect();

        for (i, cm) in samples.iter().enumerate() {
            let avg = filter.push(RawSample::Distance(*cm));
            let start = (i + 1).saturating_sub(5);
            assert!(
                (avg - mean(&samples[start..=i])).abs() < 1e-3,
                "push {i}: {avg} vs {}",
                mean(&samples[start..=i])
            );
        }
        assert!(filter.is_warm());
    }

    #[test]
    fn zero_primed_converges_from_zero() {
        let mut filter = MovingAverage::new(4, NoEchoPolicy::Zero, WarmUp::ZeroPrimed);

        assert_eq!(filter.average(), 0.0);
        assert_eq!(filter.push(RawSample::Distance(40)), 10.0);
        assert_eq!(filter.push(RawSample::Distance(40)), 20.0);
        assert_eq!(filter.push(RawSample::Distance(40)), 30.0);
        assert_eq!(filter.push(RawSample::Distance(40)), 40.0);
        assert_eq!(filter.push(RawSample::Distance(40)), 40.0);
    }

    #[test]
    fn no_echo_counts_as_zero_by_default() {
        let mut filter = partial(4);
        for _ in 0..4 {
            filter.push(RawSample::Distance(60));
        }

        assert_eq!(filter.push(RawSample::NoEcho), 45.0);
        assert_eq!(filter.push(RawSample::NoEcho), 30.0);
    }

    #[test]
    fn skip_policy_ignores_no_echo() {
        let mut filter = MovingAverage::new(4, NoEchoPolicy::Skip, WarmUp::Partial);

        assert_eq!(filter.push(RawSample::NoEcho), 0.0);
        assert!(filter.is_empty());

        filter.push(RawSample::Distance(60));
        filter.push(RawSample::Distance(62));
        assert_eq!(filter.push(RawSample::NoEcho), 61.0);
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn reset_returns_to_cold_start() {
        let mut filter = partial(3);
        filter.push(RawSample::Distance(90));
        filter.push(RawSample::Distance(90));
        filter.reset();

        assert!(filter.is_empty());
        assert_eq!(filter.push(RawSample::Distance(30)), 30.0);
    }

    #[test]
    fn zero_window_is_promoted_to_one() {
        let mut filter = partial(0);
        assert_eq!(filter.window(), 1);
        assert_eq!(filter.push(RawSample::Distance(12)), 12.0);
        assert_eq!(filter.push(RawSample::Distance(15)), 15.0);
    }
}
