//! DTOs for the refresh-grant exchange

use serde::{Deserialize, Serialize, Serializer};
use tokenward_clock::{DurationSecs, UnixTime};

use crate::{
    record::{ExtraFields, TokenFields},
    AccessToken, ClientId, ClientSecret, RefreshToken, RefreshTokenRef,
};

/// The lifetime assumed when the provider omits both `expires_in` and `expires_at`
pub const DEFAULT_LIFETIME: DurationSecs = DurationSecs(3_600);

/// Client credentials
#[derive(Debug, Serialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

impl ClientCredentials {
    /// Constructs a new set of client credentials
    pub fn new(client_id: ClientId, client_secret: ClientSecret) -> Self {
        Self {
            client_id,
            client_secret,
        }
    }
}

/// The body of a refresh-grant request
#[derive(Debug)]
pub struct RefreshGrant<'a> {
    /// The client credentials
    pub credentials: &'a ClientCredentials,

    /// The refresh token being exchanged
    pub refresh_token: &'a RefreshTokenRef,
}

impl<'a> Serialize for RefreshGrant<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshGrant", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("refresh_token", self.refresh_token)?;
        ser.serialize_field("client_id", &self.credentials.client_id)?;
        ser.serialize_field("client_secret", &self.credentials.client_secret)?;
        ser.end()
    }
}

/// A successful token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// The new access token
    pub access_token: AccessToken,
    /// A rotated refresh token, if the provider issued one
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    /// The token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// The lifetime of the access token
    #[serde(default)]
    pub expires_in: Option<DurationSecs>,
    /// An absolute expiry, sent by some providers instead of a lifetime
    #[serde(default)]
    pub expires_at: Option<UnixTime>,
    /// The granted scope
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Converts the response into token fields, resolving the expiry at `now`
    pub fn into_fields(self, now: UnixTime) -> TokenFields {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|lifetime| now + lifetime))
            .unwrap_or(now + DEFAULT_LIFETIME);

        TokenFields {
            access_token: Some(self.access_token),
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            expires_at: Some(expires_at),
            expires_in: None,
            scope: self.scope,
            extra: ExtraFields::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_carries_all_parameters() {
        let credentials = ClientCredentials::new(
            ClientId::from_static("client"),
            ClientSecret::from_static("shh"),
        );
        let refresh_token = RefreshToken::from_static("rt-123");
        let grant = RefreshGrant {
            credentials: &credentials,
            refresh_token: &refresh_token,
        };

        let value = serde_json::to_value(&grant).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": "rt-123",
                "client_id": "client",
                "client_secret": "shh",
            })
        );
    }

    #[test]
    fn expires_in_is_resolved_against_now() {
        let resp: TokenResponse = serde_json::from_str(
            r#"{"access_token":"at","token_type":"Bearer","expires_in":300}"#,
        )
        .unwrap();
        let fields = resp.into_fields(UnixTime(1_000));
        assert_eq!(fields.expires_at, Some(UnixTime(1_300)));
        assert_eq!(fields.refresh_token, None);
    }

    #[test]
    fn missing_lifetime_defaults_to_an_hour() {
        let resp: TokenResponse = serde_json::from_str(r#"{"access_token":"at"}"#).unwrap();
        let fields = resp.into_fields(UnixTime(1_000));
        assert_eq!(fields.expires_at, Some(UnixTime(4_600)));
        assert_eq!(fields.token_type, None);
    }
}
