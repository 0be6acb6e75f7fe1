use super::{run_command, CollectorError, MetricCollector};
use crate::state::{GroupWriter, Throttle};
use async_trait::async_trait;

const NAME: &str = "throttle";

/// Under-voltage right now.
const UNDER_VOLTAGE: u32 = 0x1;
/// Currently throttled.
const THROTTLED: u32 = 0x4;

/// Firmware throttling flag, registered on ARM-class boards only.
///
/// Only the "now" bits count; the sticky "has occurred" bits in the upper
/// half are ignored so the flag clears once the condition passes.
pub struct ThrottleCollector {
    writer: GroupWriter<Throttle>,
}

impl ThrottleCollector {
    pub fn new(writer: GroupWriter<Throttle>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl MetricCollector for ThrottleCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn strategy(&self) -> &'static str {
        "vcgencmd"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let text = run_command("vcgencmd", &["get_throttled"]).await?;
        let flags = parse_get_throttled(&text)?;
        self.writer.write(Throttle(is_throttled(flags))).await;
        Ok(())
    }
}

/// `throttled=0x50005`
pub fn parse_get_throttled(text: &str) -> Result<u32, CollectorError> {
    let raw = text
        .trim()
        .strip_prefix("throttled=")
        .ok_or_else(|| CollectorError::parse("vcgencmd", "throttled", text))?;
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u32::from_str_radix(hex, 16).map_err(|_| CollectorError::parse("vcgencmd", "throttled", raw))
}

pub fn is_throttled(flags: u32) -> bool {
    flags & (UNDER_VOLTAGE | THROTTLED) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_bits_set_the_flag() {
        assert!(is_throttled(parse_get_throttled("throttled=0x1\n").unwrap()));
        assert!(is_throttled(parse_get_throttled("throttled=0x50005").unwrap()));
        assert!(is_throttled(0x4));
    }

    #[test]
    fn sticky_bits_alone_do_not() {
        assert!(!is_throttled(parse_get_throttled("throttled=0x10000").unwrap()));
        assert!(!is_throttled(parse_get_throttled("throttled=0x0").unwrap()));
        // frequency capped is not throttling
        assert!(!is_throttled(0x2));
    }

    #[test]
    fn malformed_output() {
        assert!(parse_get_throttled("VCHI initialization failed").is_err());
        assert!(parse_get_throttled("throttled=0xZZ").is_err());
    }
}
