//! Scripts uploaded to the device's Python prompt.
//!
//! The device firmware runs them as-is; nothing here is parsed back.

use std::time::{SystemTime, UNIX_EPOCH};

/// Formats `time.now()` as `month/day HH:MM:SS`
const GETTIME: &str = r#"def gettime():
    t=time.now()
    return f'{t["month"]}/{t["day"]} {t["hour"]:02}:{t["minute"]:02}:{t["second"]:02}'
"#;

/// Set the clock and draw it on the display once a second
pub fn clock_script(unix_time: u64, timezone: &str, brightness: u8) -> String {
    format!(
        r#"import display, time, uasyncio
display.brightness({brightness})
time.time({unix_time})
time.zone("{timezone}")
{GETTIME}
async def showtime():
    while True:
        t=display.Text(gettime(), 50, 50, display.YELLOW)
        display.show(t)
        await uasyncio.sleep(1)

t=uasyncio.run(showtime())
"#
    )
}

/// Blank the display, set the clock, then print the time and battery level every minute
pub fn battery_script(unix_time: u64, timezone: &str) -> String {
    format!(
        r#"import display, time, device
# blank the screen
display.show()
# set the time
time.time({unix_time})
time.zone("{timezone}")
{GETTIME}
while True:
    print(gettime())
    print(device.battery_level())
    time.sleep(60)

"#
    )
}

/// Seconds since the Unix epoch, 0 if the clock is before it
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
