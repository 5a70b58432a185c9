use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Room {
    pub id: Uuid,
    pub elderly_id: Uuid,
    pub title: String,
    pub location: String,
    pub monthly_price: Decimal,
    pub total_monthly_price: Option<Decimal>,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// Monthly rent charged to the student: the total price (base plus
    /// services) when one is set, otherwise the base price.
    pub fn rent_amount(&self) -> Decimal {
        match self.total_monthly_price {
            Some(total) if !total.is_zero() => total,
            _ => self.monthly_price,
        }
    }
}
