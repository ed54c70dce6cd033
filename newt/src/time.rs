use embedded_time::Instant;

/// A duration, in milliseconds
pub type Millis = embedded_time::duration::Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the type of "ticks"
/// to u64
pub trait Clock: embedded_time::Clock<T = u64> {}
impl<C: embedded_time::Clock<T = u64>> Clock for C {}

/// Milliseconds elapsed since the clock's epoch.
///
/// The runtime keeps all of its deadlines as plain `u64` milliseconds so
/// the state machines stay non-generic; the session samples its injected
/// clock once per tick and hands the number down.
pub fn since_epoch<C: Clock>(instant: Instant<C>) -> u64 {
  Millis::try_from(instant.duration_since_epoch()).map(|m| m.0)
                                                  .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test {
  use core::cell::Cell;

  use embedded_time::clock::Error;
  use embedded_time::rate::Fraction;
  use embedded_time::Instant;
  use std_alloc::rc::Rc;

  /// A clock over a shared [`Cell`], advanced manually by tests. Clones
  /// share the same time source, so a test can keep one half while the
  /// session owns the other.
  #[derive(Debug, Clone)]
  pub(crate) struct FakeClock {
    now: Rc<Cell<u64>>,
  }

  impl FakeClock {
    pub(crate) fn new() -> Self {
      Self { now: Rc::new(Cell::new(0)) }
    }

    pub(crate) fn set(&self, ms: u64) {
      self.now.set(ms);
    }

    pub(crate) fn advance(&self, ms: u64) {
      self.now.set(self.now.get() + ms);
    }
  }

  impl embedded_time::Clock for FakeClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1000);

    fn try_now(&self) -> Result<Instant<Self>, Error> {
      Ok(Instant::new(self.now.get()))
    }
  }

  #[test]
  fn fake_clock_reports_millis() {
    let clock = FakeClock::new();
    clock.set(1234);
    assert_eq!(super::since_epoch(embedded_time::Clock::try_now(&clock).unwrap()),
               1234);
  }
}
