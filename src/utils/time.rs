//! 时间计算工具

use chrono::{DateTime, Duration, Local, TimeZone, Utc};

/// 返回"下一次本地时区的 00:00:00"（以 UTC 表示）。
///
/// 例如：今天 23:59 -> 明天 00:00；今天 00:00 -> 明天 00:00（始终取未来的午夜）。
pub fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("00:00:00 exists for every date");
    let today_midnight = Local
        .from_local_datetime(&midnight)
        .earliest()
        .unwrap_or(local);
    (today_midnight + Duration::hours(24)).with_timezone(&Utc)
}

/// 计算"今日"时间范围：从本地时区今天 0 点到现在的时长
pub fn today_elapsed(now: DateTime<Utc>) -> Duration {
    let local = now.with_timezone(&Local);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("00:00:00 exists for every date");
    let today_midnight = Local
        .from_local_datetime(&midnight)
        .earliest()
        .unwrap_or(local);
    now - today_midnight.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_today_elapsed_bounds() {
        let elapsed = today_elapsed(Utc::now());
        assert!(elapsed >= Duration::zero());
        assert!(elapsed < Duration::hours(24));
    }

    #[test]
    fn test_next_local_midnight_is_in_future() {
        let now = Utc::now();
        let midnight = next_local_midnight(now);
        assert!(midnight > now);
        // 未来的午夜不会超过 24 小时
        assert!(midnight - now <= Duration::hours(24));
    }

    #[test]
    fn test_next_local_midnight_is_midnight() {
        let midnight = next_local_midnight(Utc::now()).with_timezone(&Local);
        assert_eq!(midnight.format("%H:%M:%S").to_string(), "00:00:00");
    }
}
