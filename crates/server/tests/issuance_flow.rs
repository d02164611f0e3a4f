//! End-to-end tests against a running server, with a shell script standing
//! in for the issuance tool.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use k256::ecdsa::SigningKey;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use tempfile::TempDir;

use certgate::auth::{canonical_message, keccak256, signature::address_from_key};
use certgate::{serve, ServerHandle};
use certgate_common::{Address, IdentityKey};
use certgate_config::{AuthConfig, Config};

const CSR: &str = "-----BEGIN CERTIFICATE REQUEST-----\nMIIBVDCB+wIBADBKMQswCQYDVQQGEwJVUzEPMA0GA1UECgwGRXhhbXBsZTEqMCgG\n-----END CERTIFICATE REQUEST-----\n";
const FULLCHAIN: &str = "-----BEGIN CERTIFICATE-----\nLEAF\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\nCHAIN\n-----END CERTIFICATE-----\n";

struct Harness {
    dir: TempDir,
    handle: ServerHandle,
    client: reqwest::Client,
}

impl Harness {
    async fn start(tool_delay_secs: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(dir.path(), tool_delay_secs);
        std::fs::write(dir.path().join("creds.ini"), "dns_rfc2136_server = 127.0.0.1\n").unwrap();

        let mut config = Config::default();
        config.server.listen = "127.0.0.1:0".to_string();
        config.certificates.base_dir = dir.path().join("certs");
        config.issuer.command = tool;
        config.issuer.credentials = Some(dir.path().join("creds.ini"));
        config.rate_limit.enabled = false;

        let handle = serve(&config).await.unwrap();
        Self {
            dir,
            handle,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, query: &str) -> String {
        format!("http://{}/?{query}", self.handle.local_addr)
    }

    fn invocations(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("invocations"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn started_marker(&self) -> PathBuf {
        self.dir.path().join("started")
    }

    fn identity_dir(&self, address: &Address) -> PathBuf {
        self.dir
            .path()
            .join("certs")
            .join(IdentityKey::derive(address, 16).as_str())
    }

    async fn post(&self, query: &str, csr: Option<&str>) -> reqwest::Response {
        let mut request = self.client.post(self.url(query));
        if let Some(csr) = csr {
            let part = Part::bytes(csr.as_bytes().to_vec()).file_name("csr.pem");
            request = request.multipart(Form::new().part("csr", part));
        }
        request.send().await.unwrap()
    }
}

/// Stand-in issuance tool: records each call, optionally sleeps, then
/// writes the artifacts at the paths it was given.
fn write_fake_tool(dir: &Path, delay_secs: u32) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
echo "$@" >> "{invocations}"
touch "{started}"
sleep {delay_secs}
while [ $# -gt 0 ]; do
  case "$1" in
    --csr) [ -s "$2" ] || {{ echo "missing csr" >&2; exit 1; }}; shift ;;
    --key-path) echo "KEY" > "$2"; shift ;;
    --cert-path) echo "LEAF" > "$2"; shift ;;
    --chain-path) echo "CHAIN" > "$2"; shift ;;
    --fullchain-path) printf '%s' "$FULLCHAIN" > "$2"; shift ;;
  esac
  shift
done
"#,
        invocations = dir.join("invocations").display(),
        started = dir.join("started").display(),
    );
    let script = script.replacen(
        "#!/bin/sh\n",
        &format!("#!/bin/sh\nFULLCHAIN='{FULLCHAIN}'\n"),
        1,
    );

    let path = dir.join("fake-certbot");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Query string for a request signed by the wallet derived from `seed`.
fn signed_query(seed: u8, timestamp: u64) -> (Address, String) {
    let key = SigningKey::from_slice(&[seed; 32]).unwrap();
    let address = address_from_key(key.verifying_key());

    let auth = AuthConfig::default();
    let message = canonical_message(&auth.signature_prefix, &auth.signer_label, timestamp);
    let (sig, recid) = key
        .sign_prehash_recoverable(&keccak256(message.as_bytes()))
        .unwrap();
    let mut bytes = sig.to_bytes().to_vec();
    bytes.push(recid.to_byte() + 27);

    let query = format!(
        "address={address}&timestamp={timestamp}&signature=0x{}",
        hex::encode(bytes)
    );
    (address, query)
}

#[tokio::test]
async fn test_request_without_parameters_is_rejected() {
    let harness = Harness::start(0).await;

    let response = harness
        .client
        .post(format!("http://{}/", harness.handle.local_addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("Missing parameter"));
    assert_eq!(harness.invocations(), 0);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_future_timestamp_is_out_of_sync() {
    let harness = Harness::start(0).await;
    let window = AuthConfig::default().freshness_window_secs;
    let (_, query) = signed_query(11, now_secs() + window + 1);

    let response = harness.post(&query, Some(CSR)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("out of sync"));
    assert_eq!(harness.invocations(), 0);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_wrong_signer_is_rejected() {
    let harness = Harness::start(0).await;
    let (_, query) = signed_query(11, now_secs());
    let (other, _) = signed_query(12, now_secs());
    let query = query.replacen(
        &query[..query.find('&').unwrap()],
        &format!("address={other}"),
        1,
    );

    let response = harness.post(&query, Some(CSR)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Invalid address or signature"));
    assert_eq!(harness.invocations(), 0);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_issue_then_serve_from_cache() {
    let harness = Harness::start(0).await;
    let (address, query) = signed_query(21, now_secs());

    // First request issues.
    let response = harness.post(&query, Some(CSR)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-pem-file"
    );
    assert!(response.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains("fullchain.pem"));
    assert!(response.headers().get("x-certificate-cache").is_none());
    assert_eq!(response.text().await.unwrap(), FULLCHAIN);
    assert_eq!(harness.invocations(), 1);

    let dir = harness.identity_dir(&address);
    for artifact in ["csr", "privkey.pem", "cert.pem", "chain.pem", "fullchain.pem"] {
        assert!(dir.join(artifact).is_file(), "missing {artifact}");
    }
    assert_eq!(std::fs::read_to_string(dir.join("csr")).unwrap(), CSR);

    // Second request is answered from the store, CSR or not.
    let response = harness.post(&query, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let key = IdentityKey::derive(&address, 16);
    assert_eq!(response.headers()["x-certificate-cache"], key.as_str());
    assert_eq!(response.text().await.unwrap(), FULLCHAIN);
    assert_eq!(harness.invocations(), 1);

    // Forcing reissues.
    let response = harness.post(&format!("{query}&force=true"), Some(CSR)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-certificate-cache").is_none());
    assert_eq!(harness.invocations(), 2);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_reissue_without_csr_is_rejected() {
    let harness = Harness::start(0).await;
    let (address, query) = signed_query(22, now_secs());

    let response = harness.post(&query, None).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.invocations(), 0);
    assert!(!harness.identity_dir(&address).exists());
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_for_same_identity_conflict() {
    let harness = Harness::start(2).await;
    let (address, query) = signed_query(31, now_secs());

    let first = {
        let client = harness.client.clone();
        let url = harness.url(&query);
        tokio::spawn(async move {
            let part = Part::bytes(CSR.as_bytes().to_vec()).file_name("csr.pem");
            client
                .post(url)
                .multipart(Form::new().part("csr", part))
                .send()
                .await
                .unwrap()
        })
    };

    let marker = harness.started_marker();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !marker.exists() {
        assert!(tokio::time::Instant::now() < deadline, "issuance never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let second = harness.post(&query, Some(CSR)).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = second.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("in progress"));

    let first = first.await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.text().await.unwrap(), FULLCHAIN);
    assert_eq!(harness.invocations(), 1);
    assert!(harness.identity_dir(&address).join("fullchain.pem").is_file());

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_different_identities_issue_in_parallel() {
    let harness = Harness::start(1).await;
    let (_, query_a) = signed_query(41, now_secs());
    let (_, query_b) = signed_query(42, now_secs());

    let (a, b) = tokio::join!(
        harness.post(&query_a, Some(CSR)),
        harness.post(&query_b, Some(CSR))
    );

    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(harness.invocations(), 2);
    harness.handle.shutdown().await;
}
