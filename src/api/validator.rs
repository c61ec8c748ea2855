use serde_json::Value;
use thiserror::Error;

use crate::transfer::TransferRequest;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid JSON body: {0}")]
    MalformedBody(String),
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("receiver_id is required")]
    MissingReceiver,
    #[error("amount is required")]
    MissingAmount,
    #[error("amount must be a valid number string")]
    InvalidAmount,
    #[error("memo must be a string")]
    InvalidMemo,
    #[error("transfers must be an array")]
    NotAnArray,
    #[error("transfers[{index}]: {source}")]
    Item {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },
}

/// Amounts are base-unit integers in decimal notation and must fit in u128
pub fn validate_amount(amount: &str) -> Result<(), ValidationError> {
    if amount.is_empty() {
        return Err(ValidationError::MissingAmount);
    }
    if !amount.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::InvalidAmount);
    }
    amount
        .parse::<u128>()
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidAmount)
}

/// Parse and validate a single transfer body
pub fn parse_transfer_request(body: &Value) -> Result<TransferRequest, ValidationError> {
    let object = body.as_object().ok_or(ValidationError::NotAnObject)?;

    let receiver_id = match object.get("receiver_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(ValidationError::MissingReceiver),
    };

    let amount = match object.get("amount") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => return Err(ValidationError::MissingAmount),
        Some(_) => return Err(ValidationError::InvalidAmount),
    };
    validate_amount(&amount)?;

    let memo = match object.get("memo") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(ValidationError::InvalidMemo),
    };

    let request = TransferRequest::new(receiver_id, amount);
    Ok(match memo {
        Some(memo) => request.with_memo(memo),
        None => request,
    })
}

/// Parse `{ "transfers": [...] }`. Every item is validated before any is
/// accepted.
pub fn parse_batch_request(body: &Value) -> Result<Vec<TransferRequest>, ValidationError> {
    let transfers = body
        .get("transfers")
        .and_then(Value::as_array)
        .ok_or(ValidationError::NotAnArray)?;

    transfers
        .iter()
        .enumerate()
        .map(|(index, item)| {
            parse_transfer_request(item).map_err(|e| ValidationError::Item {
                index,
                source: Box::new(e),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_request() {
        let req = parse_transfer_request(&json!({
            "receiver_id": "alice.testnet",
            "amount": "1000000",
            "memo": "airdrop"
        }))
        .unwrap();
        assert_eq!(req.receiver_id, "alice.testnet");
        assert_eq!(req.amount, "1000000");
        assert_eq!(req.memo.as_deref(), Some("airdrop"));
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            parse_transfer_request(&json!({ "amount": "1" })),
            Err(ValidationError::MissingReceiver)
        );
        assert_eq!(
            parse_transfer_request(&json!({ "receiver_id": "", "amount": "1" })),
            Err(ValidationError::MissingReceiver)
        );
        assert_eq!(
            parse_transfer_request(&json!({ "receiver_id": "a.testnet" })),
            Err(ValidationError::MissingAmount)
        );
        assert_eq!(parse_transfer_request(&json!([])), Err(ValidationError::NotAnObject));
    }

    #[test]
    fn test_amount_rules() {
        assert!(validate_amount("0").is_ok());
        assert!(validate_amount("340282366920938463463374607431768211455").is_ok());
        assert_eq!(
            validate_amount("340282366920938463463374607431768211456"),
            Err(ValidationError::InvalidAmount)
        );
        assert_eq!(validate_amount("1.5"), Err(ValidationError::InvalidAmount));
        assert_eq!(validate_amount("-1"), Err(ValidationError::InvalidAmount));
        assert_eq!(validate_amount("abc"), Err(ValidationError::InvalidAmount));
        assert_eq!(validate_amount(""), Err(ValidationError::MissingAmount));
        assert_eq!(
            parse_transfer_request(&json!({ "receiver_id": "a.testnet", "amount": 5 })),
            Err(ValidationError::InvalidAmount)
        );
    }

    #[test]
    fn test_batch() {
        let reqs = parse_batch_request(&json!({
            "transfers": [
                { "receiver_id": "a.testnet", "amount": "1" },
                { "receiver_id": "b.testnet", "amount": "2" }
            ]
        }))
        .unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].receiver_id, "b.testnet");

        assert_eq!(
            parse_batch_request(&json!({ "transfers": "nope" })),
            Err(ValidationError::NotAnArray)
        );

        let err = parse_batch_request(&json!({
            "transfers": [
                { "receiver_id": "a.testnet", "amount": "1" },
                { "receiver_id": "b.testnet", "amount": "x" }
            ]
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "transfers[1]: amount must be a valid number string");
    }
}
