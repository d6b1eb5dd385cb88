//! Discrete PI loop whose integrator is carried in persisted state.

use super::PersistedState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiLoop {
    pub kp: f64,
    pub ki: f64,
    pub min: f64,
    pub max: f64,
}

impl PiLoop {
    pub const fn new(kp: f64, ki: f64) -> Self {
        Self {
            kp,
            ki,
            min: 0.0,
            max: 100.0,
        }
    }

    /// One step on `error`; returns the output and the next integrator value.
    ///
    /// The integrator is clamped to the output span so it cannot wind up while
    /// the output is saturated.
    pub fn step(&self, error: f64, integral: f64) -> (f64, f64) {
        let integral = (integral + self.ki * error).clamp(self.min, self.max);
        let output = (self.kp * error + integral).clamp(self.min, self.max);
        (output, integral)
    }

    /// Runs a step reading and writing the integrator under `key`.
    pub fn run(&self, error: f64, key: &str, state: &mut PersistedState) -> f64 {
        let integral = state.get(key).copied().unwrap_or(0.0);
        let (output, integral) = self.step(error, integral);
        state.insert(key.to_string(), integral);
        output
    }

    /// Resets the integrator, used when the loop is disabled.
    pub fn reset(key: &str, state: &mut PersistedState) {
        state.insert(key.to_string(), 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrator_accumulates_error() {
        let pi = PiLoop::new(0.0, 2.0);
        let mut state = PersistedState::new();
        assert_eq!(pi.run(3.0, "i", &mut state), 6.0);
        assert_eq!(pi.run(3.0, "i", &mut state), 12.0);
        assert_eq!(state["i"], 12.0);
    }

    #[test]
    fn integrator_does_not_wind_up() {
        let pi = PiLoop::new(1.0, 50.0);
        let mut state = PersistedState::new();
        for _ in 0..10 {
            assert_eq!(pi.run(10.0, "i", &mut state), 100.0);
        }
        assert_eq!(state["i"], 100.0);

        // one cycle of negative error unwinds immediately
        let output = pi.run(-1.0, "i", &mut state);
        assert_eq!(output, 49.0);
    }

    #[test]
    fn output_clamped_to_span() {
        let pi = PiLoop::new(10.0, 0.0);
        assert_eq!(pi.step(-5.0, 0.0).0, 0.0);
        assert_eq!(pi.step(50.0, 0.0).0, 100.0);
    }
}
