//! Sign in against a local portal backend and fetch the current profile.
//!
//! Before running:
//! - Start the backend on `http://localhost:8080`.
//! - Replace the email and password placeholders.
//!
//! Set `RUST_LOG=portal_access=debug` to see each request, including the
//! redacted sign-in body and any transparent refresh.

use std::error::Error;
use std::sync::Arc;

use portal_access::api::{ApiClient, ApiClientOptions, ApiRequest};
use portal_access::credentials::{CredentialSet, CredentialStore, FileStorage};
use portal_access::retry::{send_with_retry, RetryPolicy};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignIn {
    access_token: String,
    refresh_token: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let email = "REPLACE_WITH_EMAIL";
    let password = "REPLACE_WITH_PASSWORD";

    let storage = Arc::new(FileStorage::new(".portal-session.json"));
    let store = CredentialStore::load(storage);
    let client = ApiClient::new(store.clone(), ApiClientOptions::default())?
        .with_session_boundary(Arc::new(|| eprintln!("session ended, sign in again")));

    if !store.is_authenticated() {
        let response = client
            .send(
                ApiRequest::post("/auth/login")
                    .with_body(json!({ "email": email, "password": password })),
            )
            .await?;
        let signed_in: SignIn = response.json()?;
        store.set(CredentialSet::new(signed_in.access_token, signed_in.refresh_token));
        store.set_session_marker(email);
    }

    let profile = send_with_retry(&client, ApiRequest::get("/users/me"), &RetryPolicy::default())
        .await
        .map_err(|err| {
            eprintln!("{}", err.user_message());
            err
        })?
        .json::<Value>()?;
    println!("profile={profile}");
    println!("refreshes={}", client.refreshes_started());

    Ok(())
}
