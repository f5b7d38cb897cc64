//! PWM channel sessions.
//!
//! The kernel refuses any write that would leave `duty_cycle > period`, so a
//! frequency change has to order its two writes: when the period grows it is
//! written first, when it shrinks the duty cycle goes first.

use std::sync::Arc;

use log::{debug, warn};

use crate::config::Polarity;
use crate::error::{GpioError, Result};
use crate::sysfs::{Sysfs, SysfsBackend};

const NANOS_PER_SECOND: f64 = 1e9;

/// One attribute write of a period/duty commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmWrite {
    Period(u64),
    DutyCycle(u64),
}

fn period_for_frequency(frequency_hz: f64) -> Result<u64> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(GpioError::InvalidArgument(format!(
            "frequency must be positive, got {frequency_hz}"
        )));
    }
    let period = (NANOS_PER_SECOND / frequency_hz).round();
    if period < 1.0 {
        return Err(GpioError::InvalidArgument(format!(
            "frequency {frequency_hz} Hz is above 1 GHz"
        )));
    }
    Ok(period as u64)
}

fn duty_for_percent(duty_percent: f64, period_ns: u64) -> u64 {
    (duty_percent / 100.0 * period_ns as f64).round() as u64
}

fn check_percent(duty_percent: f64) -> Result<()> {
    if (0.0..=100.0).contains(&duty_percent) {
        Ok(())
    } else {
        Err(GpioError::InvalidArgument(format!(
            "duty cycle must be between 0 and 100, got {duty_percent}"
        )))
    }
}

/// Orders a period/duty commit so that `period >= duty` holds after each
/// write, given that it held for the pair currently active.
fn order_writes(current_period_ns: u64, period_ns: u64, duty_ns: u64) -> [PwmWrite; 2] {
    if period_ns > current_period_ns {
        [PwmWrite::Period(period_ns), PwmWrite::DutyCycle(duty_ns)]
    } else {
        [PwmWrite::DutyCycle(duty_ns), PwmWrite::Period(period_ns)]
    }
}

/// Writes needed to move from `current_period_ns` to `new_frequency_hz`,
/// keeping the duty cycle at `duty_percent` of the new period.
pub fn plan_frequency_change(
    current_period_ns: u64,
    new_frequency_hz: f64,
    duty_percent: f64,
) -> Result<[PwmWrite; 2]> {
    check_percent(duty_percent)?;
    let period_ns = period_for_frequency(new_frequency_hz)?;
    let duty_ns = duty_for_percent(duty_percent, period_ns);
    Ok(order_writes(current_period_ns, period_ns, duty_ns))
}

/// An exported PWM channel. Single owner; dropping it without [`close`]
/// unexports on a best-effort basis.
///
/// [`close`]: PwmChannel::close
pub struct PwmChannel<B: SysfsBackend> {
    sysfs: Arc<Sysfs<B>>,
    chip: u32,
    channel: u32,
    frequency_hz: f64,
    duty_percent: f64,
    period_ns: u64,
    duty_ns: u64,
    polarity: Polarity,
    enabled: bool,
    open: bool,
}

impl<B: SysfsBackend> PwmChannel<B> {
    /// Exports the channel, sets polarity, enables it and commits the period
    /// for `frequency_hz` with the output idle (duty 0) until [`start`].
    ///
    /// [`start`]: PwmChannel::start
    pub fn open(
        sysfs: Arc<Sysfs<B>>,
        chip: u32,
        channel: u32,
        frequency_hz: f64,
        duty_percent: f64,
        inverted: bool,
    ) -> Result<Self> {
        check_percent(duty_percent)?;
        period_for_frequency(frequency_hz)?;

        let mut pwm = Self {
            sysfs,
            chip,
            channel,
            frequency_hz,
            duty_percent,
            period_ns: 0,
            duty_ns: 0,
            polarity: Polarity::from(inverted),
            enabled: false,
            open: false,
        };

        match pwm.bring_up() {
            Err(GpioError::AlreadyExported { .. }) => {
                warn!("pwmchip{chip}/pwm{channel} is already in use, continuing anyway");
                pwm.sysfs.pwm_unexport(chip, channel)?;
                pwm.bring_up()?;
            }
            other => other?,
        }
        Ok(pwm)
    }

    fn bring_up(&mut self) -> Result<()> {
        self.sysfs.pwm_export(self.chip, self.channel)?;
        self.open = true;
        self.sysfs
            .pwm_set_polarity(self.chip, self.channel, self.polarity)?;
        self.sysfs.pwm_set_enabled(self.chip, self.channel, true)?;
        self.enabled = true;

        self.period_ns = self.sysfs.pwm_period(self.chip, self.channel)?;
        self.duty_ns = self.sysfs.pwm_duty_cycle(self.chip, self.channel)?;
        let period_ns = period_for_frequency(self.frequency_hz)?;
        self.commit(order_writes(self.period_ns, period_ns, 0))
    }

    fn commit(&mut self, writes: [PwmWrite; 2]) -> Result<()> {
        for write in writes {
            match write {
                PwmWrite::Period(ns) => {
                    self.sysfs.pwm_set_period(self.chip, self.channel, ns)?;
                    self.period_ns = ns;
                }
                PwmWrite::DutyCycle(ns) => {
                    self.sysfs.pwm_set_duty_cycle(self.chip, self.channel, ns)?;
                    self.duty_ns = ns;
                }
            }
        }
        Ok(())
    }

    /// Drives the output at the stored duty cycle.
    pub fn start(&mut self) -> Result<()> {
        let duty_ns = duty_for_percent(self.duty_percent, self.period_ns);
        self.sysfs
            .pwm_set_duty_cycle(self.chip, self.channel, duty_ns)?;
        self.duty_ns = duty_ns;
        Ok(())
    }

    /// Idles the output (duty 0) keeping the stored percentage for `start`.
    pub fn stop(&mut self) -> Result<()> {
        self.sysfs.pwm_set_duty_cycle(self.chip, self.channel, 0)?;
        self.duty_ns = 0;
        Ok(())
    }

    pub fn set_frequency(&mut self, frequency_hz: f64) -> Result<()> {
        let writes = plan_frequency_change(self.period_ns, frequency_hz, self.duty_percent)?;
        debug!(
            "pwmchip{}/pwm{}: {} Hz -> {frequency_hz} Hz as {writes:?}",
            self.chip, self.channel, self.frequency_hz
        );
        self.commit(writes)?;
        self.frequency_hz = frequency_hz;
        Ok(())
    }

    pub fn set_duty_cycle_percent(&mut self, duty_percent: f64) -> Result<()> {
        check_percent(duty_percent)?;
        let duty_ns = duty_for_percent(duty_percent, self.period_ns);
        self.sysfs
            .pwm_set_duty_cycle(self.chip, self.channel, duty_ns)?;
        self.duty_percent = duty_percent;
        self.duty_ns = duty_ns;
        Ok(())
    }

    /// Absolute duty cycle; must not exceed the current period.
    pub fn set_duty_cycle_ns(&mut self, duty_ns: u64) -> Result<()> {
        if duty_ns > self.period_ns {
            return Err(GpioError::InvalidArgument(format!(
                "duty cycle {duty_ns} ns exceeds the period of {} ns",
                self.period_ns
            )));
        }
        self.sysfs
            .pwm_set_duty_cycle(self.chip, self.channel, duty_ns)?;
        self.duty_ns = duty_ns;
        self.duty_percent = if self.period_ns == 0 {
            0.0
        } else {
            duty_ns as f64 / self.period_ns as f64 * 100.0
        };
        Ok(())
    }

    /// Polarity can't change on a live channel, so this disables around it.
    pub fn toggle_polarity(&mut self) -> Result<()> {
        let polarity = self.polarity.flipped();
        self.sysfs.pwm_set_enabled(self.chip, self.channel, false)?;
        self.enabled = false;
        self.sysfs
            .pwm_set_polarity(self.chip, self.channel, polarity)?;
        self.polarity = polarity;
        self.sysfs.pwm_set_enabled(self.chip, self.channel, true)?;
        self.enabled = true;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.open = false;
        self.sysfs.pwm_unexport(self.chip, self.channel)
    }

    pub fn chip(&self) -> u32 {
        self.chip
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn frequency(&self) -> f64 {
        self.frequency_hz
    }

    pub fn duty_cycle_percent(&self) -> f64 {
        self.duty_percent
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn duty_cycle_ns(&self) -> u64 {
        self.duty_ns
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl<B: SysfsBackend> Drop for PwmChannel<B> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.sysfs.pwm_unexport(self.chip, self.channel) {
                warn!(
                    "failed to unexport pwmchip{}/pwm{}: {e}",
                    self.chip, self.channel
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrinking_period_writes_duty_first() {
        let writes = plan_frequency_change(1_000_000, 2000.0, 50.0).expect("plan");
        assert_eq!(
            writes,
            [PwmWrite::DutyCycle(250_000), PwmWrite::Period(500_000)]
        );
    }

    #[test]
    fn growing_period_writes_period_first() {
        let writes = plan_frequency_change(500_000, 1000.0, 50.0).expect("plan");
        assert_eq!(
            writes,
            [PwmWrite::Period(1_000_000), PwmWrite::DutyCycle(500_000)]
        );
    }

    #[test]
    fn equal_period_writes_duty_first() {
        let writes = plan_frequency_change(1_000_000, 1000.0, 25.0).expect("plan");
        assert_eq!(
            writes,
            [PwmWrite::DutyCycle(250_000), PwmWrite::Period(1_000_000)]
        );
    }

    #[test]
    fn duty_rounds_to_nearest_nanosecond() {
        // 3 kHz -> 333_333.33 ns, one third of that is 111_111.11 ns
        assert_eq!(period_for_frequency(3000.0).unwrap(), 333_333);
        assert_eq!(duty_for_percent(100.0 / 3.0, 333_333), 111_111);
        assert_eq!(duty_for_percent(100.0, 333_333), 333_333);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        assert!(matches!(
            plan_frequency_change(1_000, 0.0, 50.0),
            Err(GpioError::InvalidArgument(_))
        ));
        assert!(matches!(
            plan_frequency_change(1_000, f64::NAN, 50.0),
            Err(GpioError::InvalidArgument(_))
        ));
        assert!(matches!(
            plan_frequency_change(1_000, 100.0, 100.5),
            Err(GpioError::InvalidArgument(_))
        ));
    }
}
