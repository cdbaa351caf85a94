use rand::{rngs::StdRng, Rng};

/// SNR in dB at which each mode delivers half of its frames
const THRESHOLDS_DB: [f64; 8] = [5.0, 6.0, 8.0, 10.0, 13.0, 16.0, 20.0, 21.0];
/// Steepness of the delivery curve around its threshold
const SLOPE: f64 = 1.2;
const MIN_SNR_DB: f64 = -5.0;
const MAX_SNR_DB: f64 = 35.0;

/// Radio link to one peer whose SNR drifts as a bounded random walk
#[derive(Debug, Clone)]
pub(crate) struct Link {
    snr_db: f64,
    drift_db: f64,
}

impl Link {
    pub(crate) fn new(snr_db: f64, drift_db: f64) -> Self {
        Self {
            snr_db: snr_db.clamp(MIN_SNR_DB, MAX_SNR_DB),
            drift_db,
        }
    }

    pub(crate) fn snr_db(&self) -> f64 {
        self.snr_db
    }

    /// Probability that a frame sent at `rate` is received
    pub(crate) fn delivery_probability(&self, rate: usize) -> f64 {
        1.0 / (1.0 + (-(self.snr_db - THRESHOLDS_DB[rate]) * SLOPE).exp())
    }

    /// Attempt one transmission at `rate`, returning whether it was received
    pub(crate) fn transmit(&mut self, rng: &mut StdRng, rate: usize) -> bool {
        if self.drift_db > 0.0 {
            let step = rng.gen_range(-self.drift_db..=self.drift_db);
            self.snr_db = (self.snr_db + step).clamp(MIN_SNR_DB, MAX_SNR_DB);
        }
        rng.gen_bool(self.delivery_probability(rate))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn faster_modes_need_more_snr() {
        let link = Link::new(15.0, 0.0);
        let p: Vec<_> = (0..8).map(|rate| link.delivery_probability(rate)).collect();
        assert!(p.windows(2).all(|w| w[0] >= w[1]));
        assert!(p[0] > 0.99);
        assert!(p[7] < 0.01);
    }

    #[test]
    fn drift_stays_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut link = Link::new(34.0, 3.0);
        for _ in 0..10_000 {
            link.transmit(&mut rng, 0);
            assert!((MIN_SNR_DB..=MAX_SNR_DB).contains(&link.snr_db()));
        }
    }

    #[test]
    fn static_link_keeps_snr() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut link = Link::new(12.0, 0.0);
        link.transmit(&mut rng, 3);
        assert_eq!(link.snr_db(), 12.0);
    }
}
