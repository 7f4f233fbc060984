//! Lot aging: volume held longer than the expiry range.

use super::lots::Holdings;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Start of `target_date - expire_range_days`, in exchange local time.
pub fn expiry_cutoff(
    target_date: NaiveDate,
    expire_range_days: u32,
    offset: FixedOffset,
) -> DateTime<Utc> {
    let cutoff_date = target_date - Duration::days(i64::from(expire_range_days));
    let local_midnight = cutoff_date.and_time(NaiveTime::MIN);
    offset
        .from_local_datetime(&local_midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local_midnight))
}

/// Sum open volume per market over lots opened strictly before `cutoff`.
///
/// Markets without any eligible volume are left out.
pub fn expired_volume(holdings: &Holdings, cutoff: DateTime<Utc>) -> BTreeMap<String, Decimal> {
    let mut expired: BTreeMap<String, Decimal> = BTreeMap::new();

    for lot in holdings.iter_lots() {
        if lot.opened_at < cutoff && lot.remaining_volume > Decimal::ZERO {
            *expired.entry(lot.market).or_insert(Decimal::ZERO) += lot.remaining_volume;
        }
    }

    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::TradeKind;
    use crate::ledger::lots::tests::event;
    use crate::ledger::LotLedger;
    use rust_decimal_macros::dec;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn local(date: NaiveDate, hour: u32) -> DateTime<Utc> {
        kst()
            .from_local_datetime(&date.and_hms_opt(hour, 0, 0).unwrap())
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_cutoff_is_local_midnight() {
        let target = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let cutoff = expiry_cutoff(target, 40, kst());
        // 2024-03-31 00:00 KST == 2024-03-30 15:00 UTC
        assert_eq!(cutoff.to_rfc3339(), "2024-03-30T15:00:00+00:00");
    }

    #[test]
    fn test_lot_older_than_range_is_expired() {
        let target = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let events = vec![
            event("1", TradeKind::Buy, "KRW-OLD", dec!(3), local(target - Duration::days(41), 10)),
            event("2", TradeKind::Buy, "KRW-NEW", dec!(7), local(target - Duration::days(39), 10)),
        ];
        let holdings = LotLedger::build(&events);

        let expired = expired_volume(&holdings, expiry_cutoff(target, 40, kst()));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired["KRW-OLD"], dec!(3));
        assert!(!expired.contains_key("KRW-NEW"));
    }

    #[test]
    fn test_only_old_lots_of_a_market_count() {
        let target = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let events = vec![
            event("1", TradeKind::Buy, "KRW-A", dec!(2), local(target - Duration::days(60), 9)),
            event("2", TradeKind::Buy, "KRW-A", dec!(5), local(target - Duration::days(50), 9)),
            event("3", TradeKind::Buy, "KRW-A", dec!(4), local(target - Duration::days(5), 9)),
            event("4", TradeKind::Sell, "KRW-A", dec!(1), local(target - Duration::days(45), 9)),
        ];
        let holdings = LotLedger::build(&events);

        let expired = expired_volume(&holdings, expiry_cutoff(target, 40, kst()));
        assert_eq!(expired["KRW-A"], dec!(6));
    }

    #[test]
    fn test_empty_holdings_yield_nothing() {
        let target = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let expired = expired_volume(&Holdings::default(), expiry_cutoff(target, 40, kst()));
        assert!(expired.is_empty());
    }
}
