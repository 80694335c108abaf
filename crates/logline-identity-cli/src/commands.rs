use std::time::Duration;

use anyhow::{Context, bail};
use logline_identity::{Auth, Claims, CookieOptions, Token, build_session_cookie};
use serde_json::json;

use crate::{Commands, pout};

fn parse_ttl(ttl: &str) -> anyhow::Result<Duration> {
    let s = ttl.trim().to_lowercase();
    let (digits, unit) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], c),
        _ => (s.as_str(), 's'),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid TTL: {ttl}"))?;
    let secs = match unit {
        's' => n,
        'm' => n * 60,
        'h' => n * 3600,
        'd' => n * 86_400,
        _ => bail!("Invalid TTL format: {ttl}. Use e.g. '30m', '12h', '5d'"),
    };
    Ok(Duration::from_secs(secs))
}

fn parse_claims(raw: &str) -> anyhow::Result<Claims> {
    let value: serde_json::Value = serde_json::from_str(raw).context("claims are not valid JSON")?;
    Ok(Claims::try_from(value)?)
}

fn token_summary(token: &Token) -> String {
    format!(
        "Valid token for uid {} (issued {}, expires {})",
        token.uid().unwrap_or("-"),
        token.issued_at(),
        token.expires_at()
    )
}

pub async fn run(auth: &Auth, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::MintToken { uid, claims } => {
            let claims = claims.as_deref().map(parse_claims).transpose()?;
            let token = auth.create_custom_token(&uid, claims.as_ref())?;
            pout(json, json!({"uid": uid, "token": token}), &token)?;
        }
        Commands::VerifyCustomToken { token } => {
            let decoded = auth.verify_custom_token(&token).await?;
            pout(json, serde_json::to_value(&decoded)?, &token_summary(&decoded))?;
        }
        Commands::VerifyIdToken {
            token,
            check_revoked,
        } => {
            let decoded = if check_revoked {
                auth.verify_id_token_and_check_revoked(&token).await?
            } else {
                auth.verify_id_token(&token).await?
            };
            pout(json, serde_json::to_value(&decoded)?, &token_summary(&decoded))?;
        }
        Commands::CreateSessionCookie {
            id_token,
            ttl,
            set_cookie,
        } => {
            let duration = parse_ttl(&ttl)?;
            let cookie = auth.create_session_cookie(&id_token, Some(duration)).await?;
            let text = if set_cookie {
                build_session_cookie(&cookie, duration, &CookieOptions::default())?
            } else {
                cookie.clone()
            };
            pout(
                json,
                json!({"session_cookie": cookie, "expires_in": duration.as_secs()}),
                &text,
            )?;
        }
        Commands::VerifySessionCookie {
            cookie,
            check_revoked,
        } => {
            if check_revoked {
                let user = auth.verify_session_cookie_and_check_revoked(&cookie).await?;
                pout(
                    json,
                    serde_json::to_value(&user)?,
                    &format!("Session cookie valid for uid {}", user.uid),
                )?;
            } else {
                let decoded = auth.verify_session_cookie(&cookie).await?;
                pout(json, serde_json::to_value(&decoded)?, &token_summary(&decoded))?;
            }
        }
        Commands::GetUser { uid, email } => {
            let user = match (uid, email) {
                (_, Some(email)) => auth.get_user_by_email(&email).await?,
                (Some(uid), None) => auth.get_user(&uid).await?,
                (None, None) => bail!("Pass a uid or --email"),
            };
            let text = format!(
                "{} <{}>{}",
                user.uid,
                user.email.as_deref().unwrap_or("no email"),
                if user.disabled { " (disabled)" } else { "" }
            );
            pout(json, serde_json::to_value(&user)?, &text)?;
        }
        Commands::Revoke { uid } => {
            auth.revoke_refresh_tokens(&uid).await?;
            pout(
                json,
                json!({"ok": true, "uid": uid}),
                &format!("Revoked refresh tokens of {uid}"),
            )?;
        }
        Commands::DeleteUser { uid } => {
            auth.delete_user(&uid).await?;
            pout(json, json!({"ok": true, "uid": uid}), &format!("Deleted {uid}"))?;
        }
    }
    Ok(())
}
