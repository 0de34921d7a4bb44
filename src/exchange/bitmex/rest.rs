//! Signed REST calls.

use chrono::Utc;
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ExchangeError, Result};

use super::signing::sign;
use super::BitmexClient;

/// Wire body of `POST /api/v1/order`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NewOrderBody {
    pub symbol: String,
    pub ord_type: String,
    pub side: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub order_qty: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub price: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub stop_px: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_inst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "clOrdID")]
    pub cl_ord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peg_price_type: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub peg_offset_value: Option<Decimal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CancelOrderBody {
    #[serde(rename = "orderID")]
    pub order_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LeverageBody {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub leverage: Decimal,
}

impl BitmexClient {
    pub(super) async fn signed_request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let body_text = match body {
            Some(body) => serde_json::to_string(body)?,
            None => String::new(),
        };
        let expires = Utc::now().timestamp() + 10;
        let signature = sign(
            &self.credentials.api_secret,
            method.as_str(),
            path_and_query,
            expires,
            &body_text,
        );

        let url = format!("{}{}", self.rest_url, path_and_query);
        let mut request = self
            .http
            .request(method, url)
            .header("api-expires", expires.to_string())
            .header("api-key", &self.credentials.api_key)
            .header("api-signature", signature);
        if !body_text.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_text);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(classify_http_failure(status, &text).into());
        }

        serde_json::from_str(&text).map_err(|error| {
            ExchangeError::BadResponse(format!("undecodable response: {error}")).into()
        })
    }
}

pub(super) fn map_transport_error(error: reqwest::Error) -> crate::error::Error {
    if error.is_timeout() {
        ExchangeError::Timeout(error.to_string()).into()
    } else {
        ExchangeError::Network(error.to_string()).into()
    }
}

/// Map an HTTP failure to the retry taxonomy. The body rides along in
/// the library's `bitmex {json}` convention so the orchestrator's
/// message parser sees one shape everywhere.
pub(super) fn classify_http_failure(status: StatusCode, body: &str) -> ExchangeError {
    let message = format!("bitmex {body}");
    let lowered = body.to_ascii_lowercase();

    match status.as_u16() {
        401 => ExchangeError::Authentication(message),
        403 => ExchangeError::Permission(message),
        404 => ExchangeError::OrderNotFound(message),
        400 => {
            if lowered.contains("insufficient") {
                ExchangeError::InsufficientFunds(message)
            } else if lowered.contains("not found") || lowered.contains("unable to cancel") {
                ExchangeError::OrderNotFound(message)
            } else if lowered.contains("invalid ordtype")
                || lowered.contains("invalid order")
                || lowered.contains("execinst")
            {
                ExchangeError::InvalidOrder(message)
            } else {
                ExchangeError::InvalidArguments(message)
            }
        }
        408 | 504 => ExchangeError::Timeout(message),
        500..=599 => ExchangeError::Network(message),
        _ => ExchangeError::Other(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_body_serializes_camel_case_and_skips_absent_fields() {
        let body = NewOrderBody {
            symbol: "XBTUSD".into(),
            ord_type: "Stop".into(),
            side: "Sell".into(),
            order_qty: Some(dec!(100)),
            price: None,
            stop_px: Some(dec!(40000.5)),
            exec_inst: Some("ReduceOnly,MarkPrice".into()),
            cl_ord_id: Some("abc_def_a1b2".into()),
            peg_price_type: None,
            peg_offset_value: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["ordType"], "Stop");
        assert_eq!(json["stopPx"], 40000.5);
        assert_eq!(json["clOrdID"], "abc_def_a1b2");
        assert!(json.get("price").is_none());
        assert!(json.get("pegOffsetValue").is_none());
    }

    #[test]
    fn auth_failures_classify_as_fatal() {
        let error = classify_http_failure(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"message":"Invalid API Key.","name":"HTTPError"}}"#,
        );
        assert!(error.is_fatal());
        assert!(matches!(error, ExchangeError::Authentication(_)));
    }

    #[test]
    fn insufficient_balance_is_fatal_invalid_is_fatal_server_errors_are_not() {
        let funds = classify_http_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"Account has insufficient Available Balance"}}"#,
        );
        assert!(matches!(funds, ExchangeError::InsufficientFunds(_)));

        let invalid = classify_http_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"Invalid ordType"}}"#,
        );
        assert!(matches!(invalid, ExchangeError::InvalidOrder(_)));

        let overloaded = classify_http_failure(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":{"message":"The system is currently overloaded."}}"#,
        );
        assert!(!overloaded.is_fatal());
    }

    #[test]
    fn failure_messages_keep_the_library_prefix() {
        let error = classify_http_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"Invalid orderQty"}}"#,
        );
        match &error {
            ExchangeError::InvalidOrder(message) => {
                assert_eq!(
                    crate::exchange::parse_error_message(message),
                    "Invalid orderQty"
                );
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
