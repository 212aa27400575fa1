use burn::config::Config;

/// Multiplicative learning-rate decay after a plateau of non-improving loss.
///
/// The rate is cut by `factor` once the monitored loss has failed to improve
/// for more than `patience` consecutive steps, and never drops below `min_lr`.
#[derive(Config, Debug)]
pub struct ReduceOnPlateauConfig {
    pub init_lr: f64,
    #[config(default = "2f64.cbrt().recip()")]
    pub factor: f64,
    #[config(default = 100)]
    pub patience: usize,
    #[config(default = 1.0e-4)]
    pub min_lr: f64,
}

impl ReduceOnPlateauConfig {
    pub fn init(&self) -> ReduceOnPlateau {
        ReduceOnPlateau {
            lr: self.init_lr,
            factor: self.factor,
            patience: self.patience,
            min_lr: self.min_lr,
            best_loss: f64::INFINITY,
            bad_steps: 0,
        }
    }
}

#[derive(Debug)]
pub struct ReduceOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    best_loss: f64,
    bad_steps: usize,
}

impl ReduceOnPlateau {
    /// Feeds one loss observation and returns the learning rate to use next.
    pub fn step(&mut self, loss: f64) -> f64 {
        if loss < self.best_loss {
            self.best_loss = loss;
            self.bad_steps = 0;
        } else {
            self.bad_steps += 1;
            if self.bad_steps > self.patience {
                self.lr = (self.lr * self.factor).max(self.min_lr);
                self.bad_steps = 0;
            }
        }
        self.lr
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn improving_loss_keeps_the_rate() {
        let mut sched = ReduceOnPlateauConfig::new(0.1).with_patience(2).init();
        for i in 0..10 {
            assert_eq!(sched.step(1.0 / (i + 1) as f64), 0.1);
        }
    }

    #[test]
    fn plateau_reduces_after_patience() {
        let mut sched = ReduceOnPlateauConfig::new(0.1)
            .with_factor(0.5)
            .with_patience(2)
            .init();

        sched.step(1.0);
        // Two stalled steps are tolerated, the third triggers the cut.
        assert_eq!(sched.step(1.0), 0.1);
        assert_eq!(sched.step(1.0), 0.1);
        assert_eq!(sched.step(1.0), 0.05);
    }

    #[test]
    fn rate_is_bounded_below() {
        let mut sched = ReduceOnPlateauConfig::new(0.1)
            .with_factor(0.1)
            .with_patience(0)
            .with_min_lr(1.0e-3)
            .init();

        sched.step(1.0);
        for _ in 0..50 {
            sched.step(1.0);
        }
        assert_eq!(sched.lr(), 1.0e-3);
    }
}
