use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Platform commission, in percent of the monthly amount.
pub const PLATFORM_FEE_PERCENT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub rental_id: Uuid,
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub elderly_amount: Decimal,
    pub payment_date: Option<DateTime<Utc>>,
    pub due_date: DateTime<Utc>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub rental_id: Uuid,
    pub split: PaymentSplit,
    pub payment_date: Option<DateTime<Utc>>,
    pub due_date: DateTime<Utc>,
    pub status: PaymentStatus,
}

/// How one payment is divided between the platform and the host.
///
/// The fee is rounded to cents and the host share is the exact remainder,
/// so `platform_fee + elderly_amount == amount` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub elderly_amount: Decimal,
}

impl PaymentSplit {
    pub fn from_amount(amount: Decimal) -> Self {
        let platform_fee = (amount * Decimal::from(PLATFORM_FEE_PERCENT) / Decimal::from(100))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        Self {
            amount,
            platform_fee,
            elderly_amount: amount - platform_fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn split_of_round_amount() {
        let split = PaymentSplit::from_amount(Decimal::from(300));
        assert_eq!(split.platform_fee, Decimal::from(30));
        assert_eq!(split.elderly_amount, Decimal::from(270));
    }

    #[test]
    fn split_always_adds_up_to_the_cent() {
        for raw in ["0.05", "333.33", "249.99", "1", "0.01", "1234.56"] {
            let amount = Decimal::from_str(raw).unwrap();
            let split = PaymentSplit::from_amount(amount);
            assert_eq!(split.platform_fee + split.elderly_amount, amount, "amount {}", raw);
            assert!(split.platform_fee.scale() <= 2);
        }
    }

    #[test]
    fn fee_rounds_half_cents_up() {
        let split = PaymentSplit::from_amount(Decimal::from_str("0.05").unwrap());
        assert_eq!(split.platform_fee, Decimal::from_str("0.01").unwrap());
        assert_eq!(split.elderly_amount, Decimal::from_str("0.04").unwrap());
    }
}
