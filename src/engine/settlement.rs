use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::AppError;
use crate::models::order::{Amount, PaymentMethod, Settlement};

/// What the courier reports at the door.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PaymentDeclaration {
    pub method: PaymentMethod,
    /// Cash physically received. Omitted means exact change.
    pub cash_received: Option<Amount>,
}

impl PaymentDeclaration {
    pub fn cash(received: Amount) -> Self {
        Self {
            method: PaymentMethod::Cash,
            cash_received: Some(received),
        }
    }

    pub fn transfer() -> Self {
        Self {
            method: PaymentMethod::Transfer,
            cash_received: None,
        }
    }
}

/// Computes the settlement record for an order total. Transfers are not
/// reconciled here.
pub fn settle(
    total: Amount,
    declaration: &PaymentDeclaration,
    at: DateTime<Utc>,
) -> Result<Settlement, AppError> {
    match declaration.method {
        PaymentMethod::Cash => {
            let received = declaration.cash_received.unwrap_or(total);
            if received < 0 {
                return Err(AppError::BadRequest(
                    "cash received must not be negative".to_string(),
                ));
            }
            if received < total {
                return Err(AppError::InsufficientPayment { total, received });
            }

            Ok(Settlement {
                method: PaymentMethod::Cash,
                cash_received: Some(received),
                change: (received - total).max(0),
                settled_at: at,
            })
        }
        PaymentMethod::Transfer => Ok(Settlement {
            method: PaymentMethod::Transfer,
            cash_received: None,
            change: 0,
            settled_at: at,
        }),
    }
}
