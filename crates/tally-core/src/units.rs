//! Conversions between durations and decimal quantities

use chrono::Duration;
use rust_decimal::Decimal;

/// Duration expressed in (fractional) seconds
pub fn seconds(duration: Duration) -> Decimal {
    Decimal::new(duration.num_milliseconds(), 3).normalize()
}

/// Round `duration` up to the next multiple of `increment`
pub fn round_up_to(increment: Duration, duration: Duration) -> Duration {
    let step = increment.num_milliseconds();
    if step <= 0 {
        return duration;
    }
    let millis = duration.num_milliseconds();
    let rem = millis % step;
    if rem == 0 {
        duration
    } else {
        Duration::milliseconds(millis - rem + step)
    }
}
