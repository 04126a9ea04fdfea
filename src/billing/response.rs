use serde::{Deserialize, Serialize};

/// key: billing-response-code -> backend result vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    UserCanceled,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    ItemUnavailable,
    ServiceDisconnected,
    ServiceTimeout,
    ServiceUnavailable,
    BillingUnavailable,
    FeatureNotSupported,
    DeveloperError,
}

/// How the engine reacts to a response code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// Retried through the backoff scheduler.
    Transient,
    /// Surfaced to the caller once, never retried.
    Permanent,
}

impl ResponseCode {
    pub const ALL: [ResponseCode; 12] = [
        ResponseCode::Ok,
        ResponseCode::UserCanceled,
        ResponseCode::Error,
        ResponseCode::ItemAlreadyOwned,
        ResponseCode::ItemNotOwned,
        ResponseCode::ItemUnavailable,
        ResponseCode::ServiceDisconnected,
        ResponseCode::ServiceTimeout,
        ResponseCode::ServiceUnavailable,
        ResponseCode::BillingUnavailable,
        ResponseCode::FeatureNotSupported,
        ResponseCode::DeveloperError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::UserCanceled => "USER_CANCELED",
            ResponseCode::Error => "ERROR",
            ResponseCode::ItemAlreadyOwned => "ITEM_ALREADY_OWNED",
            ResponseCode::ItemNotOwned => "ITEM_NOT_OWNED",
            ResponseCode::ItemUnavailable => "ITEM_UNAVAILABLE",
            ResponseCode::ServiceDisconnected => "SERVICE_DISCONNECTED",
            ResponseCode::ServiceTimeout => "SERVICE_TIMEOUT",
            ResponseCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ResponseCode::BillingUnavailable => "BILLING_UNAVAILABLE",
            ResponseCode::FeatureNotSupported => "FEATURE_NOT_SUPPORTED",
            ResponseCode::DeveloperError => "DEVELOPER_ERROR",
        }
    }

    /// Integer code used on the wire by the purchasing service.
    pub fn code(&self) -> i32 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::UserCanceled => 1,
            ResponseCode::ServiceUnavailable => 2,
            ResponseCode::BillingUnavailable => 3,
            ResponseCode::ItemUnavailable => 4,
            ResponseCode::DeveloperError => 5,
            ResponseCode::Error => 6,
            ResponseCode::ItemAlreadyOwned => 7,
            ResponseCode::ItemNotOwned => 8,
            ResponseCode::ServiceDisconnected => -1,
            ResponseCode::FeatureNotSupported => -2,
            ResponseCode::ServiceTimeout => -3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.code() == code)
    }

    pub fn classify(&self) -> ResponseClass {
        match self {
            ResponseCode::Ok => ResponseClass::Success,
            ResponseCode::ServiceDisconnected
            | ResponseCode::ServiceTimeout
            | ResponseCode::ServiceUnavailable => ResponseClass::Transient,
            ResponseCode::UserCanceled
            | ResponseCode::Error
            | ResponseCode::ItemAlreadyOwned
            | ResponseCode::ItemNotOwned
            | ResponseCode::ItemUnavailable
            | ResponseCode::BillingUnavailable
            | ResponseCode::FeatureNotSupported
            | ResponseCode::DeveloperError => ResponseClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.classify() == ResponseClass::Transient
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_codes_are_transient() {
        for code in [
            ResponseCode::ServiceDisconnected,
            ResponseCode::ServiceTimeout,
            ResponseCode::ServiceUnavailable,
        ] {
            assert_eq!(code.classify(), ResponseClass::Transient, "{code}");
        }
    }

    #[test]
    fn user_facing_codes_are_permanent() {
        let permanent = ResponseCode::ALL
            .into_iter()
            .filter(|code| code.classify() == ResponseClass::Permanent)
            .count();
        assert_eq!(permanent, 8);
        assert_eq!(ResponseCode::Ok.classify(), ResponseClass::Success);
    }

    #[test]
    fn wire_codes_resolve_back() {
        assert_eq!(ResponseCode::from_code(-3), Some(ResponseCode::ServiceTimeout));
        assert_eq!(ResponseCode::from_code(7), Some(ResponseCode::ItemAlreadyOwned));
        assert_eq!(ResponseCode::from_code(42), None);
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_string(&ResponseCode::ItemNotOwned).unwrap();
        assert_eq!(json, "\"ITEM_NOT_OWNED\"");
    }
}
