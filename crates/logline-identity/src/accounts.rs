//! Account lookup and management.

use crate::claims::Claims;
use crate::dispatch::{RequestDispatcher, RequestSpec, accept};
use crate::signer::validate_uid;
use crate::{Error, Result};

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GetAccountInfoRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    local_id: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    email: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetAccountInfoResponse {
    #[serde(default)]
    users: Vec<AccountInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    disabled: bool,
    /// Epoch seconds; the backend sends it as a decimal string.
    #[serde(default)]
    valid_since: Option<Value>,
    /// JSON object serialized as a string.
    #[serde(default)]
    custom_attributes: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetAccountInfoRequest {
    local_id: String,
    valid_since: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetAccountInfoResponse {
    #[serde(default)]
    local_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeleteAccountRequest {
    local_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteAccountResponse {}

pub(crate) static GET_ACCOUNT_INFO: RequestSpec<GetAccountInfoRequest, GetAccountInfoResponse> =
    RequestSpec {
        method: Method::POST,
        endpoint: "getAccountInfo",
        validate_request: |req| {
            if req.local_id.is_empty() && req.email.is_empty() {
                Err(Error::MissingRequestTarget)
            } else {
                Ok(())
            }
        },
        validate_response: |resp| {
            if resp.users.is_empty() {
                Err(Error::UserNotFound)
            } else {
                Ok(())
            }
        },
    };

pub(crate) static SET_ACCOUNT_INFO: RequestSpec<SetAccountInfoRequest, SetAccountInfoResponse> =
    RequestSpec {
        method: Method::POST,
        endpoint: "setAccountInfo",
        validate_request: |req| validate_uid(&req.local_id),
        validate_response: |resp| {
            if resp.local_id.is_empty() {
                Err(Error::IllegalType("setAccountInfo response has no localId".to_string()))
            } else {
                Ok(())
            }
        },
    };

pub(crate) static DELETE_ACCOUNT: RequestSpec<DeleteAccountRequest, DeleteAccountResponse> =
    RequestSpec {
        method: Method::POST,
        endpoint: "deleteAccount",
        validate_request: |req| validate_uid(&req.local_id),
        validate_response: accept,
    };

/// An account as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    /// Stable account identifier.
    pub uid: String,
    /// Primary email address, if any.
    pub email: Option<String>,
    /// Whether the owner has confirmed `email`.
    pub email_verified: bool,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    /// E.164 phone number, if any.
    pub phone_number: Option<String>,
    /// Disabled accounts cannot sign in.
    pub disabled: bool,
    /// Tokens issued before this instant (epoch milliseconds) are revoked.
    pub tokens_valid_after_millis: i64,
    /// Developer claims stamped into every token issued for this account.
    pub custom_claims: Claims,
}

impl TryFrom<AccountInfo> for UserRecord {
    type Error = Error;

    fn try_from(info: AccountInfo) -> Result<Self> {
        let valid_since_secs = match &info.valid_since {
            None | Some(Value::Null) => 0,
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                Error::IllegalType(format!("validSince is not an integer: {n}"))
            })?,
            Some(Value::String(s)) if s.is_empty() => 0,
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map_err(|_| Error::IllegalType(format!("validSince is not an integer: {s:?}")))?,
            Some(other) => {
                return Err(Error::IllegalType(format!(
                    "validSince has unexpected type: {other}"
                )));
            }
        };

        let custom_claims = match info.custom_attributes.as_deref() {
            None | Some("") => Claims::new(),
            Some(raw) => {
                let value: Value = serde_json::from_str(raw).map_err(|e| {
                    Error::IllegalType(format!("customAttributes is not JSON: {e}"))
                })?;
                Claims::try_from(value)?
            }
        };

        Ok(Self {
            uid: info.local_id,
            email: info.email,
            email_verified: info.email_verified,
            display_name: info.display_name,
            photo_url: info.photo_url,
            phone_number: info.phone_number,
            disabled: info.disabled,
            tokens_valid_after_millis: valid_since_secs.saturating_mul(1000),
            custom_claims,
        })
    }
}

/// Looks up accounts by uid.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch the account with this uid, or [`Error::UserNotFound`].
    async fn get_account(&self, uid: &str) -> Result<UserRecord>;
}

/// Identity Toolkit account operations.
#[derive(Debug, Clone)]
pub struct AccountsClient {
    dispatcher: RequestDispatcher,
}

impl AccountsClient {
    /// Client that sends every call through `dispatcher`.
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Fetch the account with this uid.
    #[instrument(skip(self))]
    pub async fn get_user(&self, uid: &str) -> Result<UserRecord> {
        let req = GetAccountInfoRequest {
            local_id: non_empty(uid),
            ..Default::default()
        };
        self.lookup(&req).await
    }

    /// Fetch the account with this email address.
    #[instrument(skip(self, email))]
    pub async fn get_user_by_email(&self, email: &str) -> Result<UserRecord> {
        let req = GetAccountInfoRequest {
            email: non_empty(email),
            ..Default::default()
        };
        self.lookup(&req).await
    }

    async fn lookup(&self, req: &GetAccountInfoRequest) -> Result<UserRecord> {
        let resp = self.dispatcher.call(&GET_ACCOUNT_INFO, req).await?;
        let info = resp.users.into_iter().next().ok_or(Error::UserNotFound)?;
        UserRecord::try_from(info)
    }

    /// Delete the account with this uid.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, uid: &str) -> Result<()> {
        let req = DeleteAccountRequest {
            local_id: uid.to_string(),
        };
        self.dispatcher.call(&DELETE_ACCOUNT, &req).await?;
        tracing::info!(target: "identity.accounts", "account deleted");
        Ok(())
    }

    /// Revoke every refresh token of `uid` by moving its valid-since
    /// timestamp to now. Tokens issued before now fail revocation checks.
    #[instrument(skip(self))]
    pub async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()> {
        self.revoke_at(uid, crate::now_epoch_secs()).await
    }

    pub(crate) async fn revoke_at(&self, uid: &str, now: i64) -> Result<()> {
        let req = SetAccountInfoRequest {
            local_id: uid.to_string(),
            valid_since: now,
        };
        self.dispatcher.call(&SET_ACCOUNT_INFO, &req).await?;
        tracing::info!(target: "identity.accounts", valid_since = now, "refresh tokens revoked");
        Ok(())
    }
}

#[async_trait]
impl AccountStore for AccountsClient {
    async fn get_account(&self, uid: &str) -> Result<UserRecord> {
        self.get_user(uid).await
    }
}

fn non_empty(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value.to_string()]
    }
}
