//! Driver for object ledgers backed by a separate blob store.
//!
//! Records are owned objects of the `cartridge::Record` type, with the 64-byte
//! record as a hex field and an optional `blob_id` pointing at file contents
//! in the blob store. Blob reads go through the aggregator, blob writes
//! through the publisher.
//!
//! ```text
//! header object ──blob_id──▶ aggregator GET /v1/blobs/{id}
//! upload        ──bytes────▶ publisher  PUT /v1/blobs?epochs=N
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::rpc::{
    classify_status, parse_with, JsonRpcClient, ParseStrategy, HEIGHT_STRATEGIES,
    REFERENCE_STRATEGIES,
};
use super::{
    BackendKind, LedgerDriver, Page, RawRecord, SignRequest, StorageMode, TransactionSigner,
    WriteRef, WriteRequest,
};
use crate::error::{Error, Result};
use crate::record::{CartridgeKey, RecordKind};
use crate::retry::RetryPolicy;

const DEFAULT_EPOCHS: u32 = 5;

/// Large blobs get a longer per-request timeout than RPC calls.
const BLOB_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ObjectLedgerDriver {
    rpc: JsonRpcClient,
    http: Client,
    aggregator_url: String,
    publisher_url: Option<String>,
    epochs: u32,
    package_id: String,
    signer: Option<Arc<dyn TransactionSigner>>,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnedObjectsPage {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct OwnedObject {
    data: Option<ObjectData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectData {
    object_id: String,
    #[serde(default)]
    version: Value,
    #[serde(default)]
    content: Option<ObjectContent>,
}

#[derive(Debug, Deserialize)]
struct ObjectContent {
    #[serde(default)]
    fields: RecordFields,
}

#[derive(Debug, Default, Deserialize)]
struct RecordFields {
    #[serde(default)]
    record: Option<String>,
    #[serde(default)]
    blob_id: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
}

fn newly_created(value: &Value) -> Option<String> {
    value
        .get("newlyCreated")?
        .get("blobObject")?
        .get("blobId")?
        .as_str()
        .map(str::to_string)
}

fn already_certified(value: &Value) -> Option<String> {
    value
        .get("alreadyCertified")?
        .get("blobId")?
        .as_str()
        .map(str::to_string)
}

const BLOB_ID_STRATEGIES: &[ParseStrategy<String>] = &[
    ParseStrategy::new("newly created", newly_created),
    ParseStrategy::new("already certified", already_certified),
];

impl ObjectLedgerDriver {
    pub fn new(
        rpc: JsonRpcClient,
        aggregator_url: &str,
        package_id: &str,
        signer: Option<Arc<dyn TransactionSigner>>,
    ) -> Self {
        let http = rpc.http().clone();
        let retry = rpc.retry_policy();
        Self {
            rpc,
            http,
            aggregator_url: aggregator_url.trim_end_matches('/').to_string(),
            publisher_url: None,
            epochs: DEFAULT_EPOCHS,
            package_id: package_id.to_string(),
            signer,
            retry,
        }
    }

    pub fn with_publisher(mut self, publisher_url: Option<String>, epochs: u32) -> Self {
        self.publisher_url = publisher_url.map(|url| url.trim_end_matches('/').to_string());
        self.epochs = epochs.max(1);
        self
    }

    fn record_type(&self) -> String {
        format!("{}::cartridge::Record", self.package_id)
    }

    fn to_record(object: ObjectData) -> RawRecord {
        let fields = object.content.map(|c| c.fields).unwrap_or_default();
        let payload = fields
            .record
            .as_deref()
            .map(|data| data.trim_start_matches("0x"))
            .filter(|data| RecordKind::sniff_hex(data).is_some())
            .and_then(|data| hex::decode(data).ok())
            .map(Bytes::from)
            .unwrap_or_default();
        let height = object
            .version
            .as_u64()
            .or_else(|| object.version.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or_default();

        RawRecord {
            id: object.object_id,
            owner: fields.publisher,
            height,
            payload,
            content_ref: fields.blob_id,
        }
    }

    async fn ensure_writer_ready(&self) -> Result<&Arc<dyn TransactionSigner>> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::NotAuthorized("no signer configured".to_string()))?;
        if !signer.is_unlocked().await {
            return Err(Error::WriterLocked(signer.writer_address()));
        }
        Ok(signer)
    }
}

#[async_trait]
impl LedgerDriver for ObjectLedgerDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::ObjectLedger
    }

    fn storage_mode(&self) -> StorageMode {
        StorageMode::Blob
    }

    fn address_for_key(&self, key: &CartridgeKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"object");
        hasher.update(key.as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    fn writer_address(&self) -> Option<String> {
        self.signer.as_ref().map(|s| s.writer_address())
    }

    async fn current_height(&self) -> Result<u64> {
        let result = self
            .rpc
            .call("sui_getLatestCheckpointSequenceNumber", json!([]))
            .await?;
        Ok(parse_with(&result, HEIGHT_STRATEGIES, "checkpoint sequence number")?.value)
    }

    async fn fetch_page(
        &self,
        owner: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let query = json!({
            "filter": {"StructType": self.record_type()},
            "options": {"showContent": true, "showOwner": true},
        });
        let result = self
            .rpc
            .call(
                "suix_getOwnedObjects",
                json!([owner, query, cursor, page_size]),
            )
            .await?;
        let page: OwnedObjectsPage = serde_json::from_value(result)
            .map_err(|e| Error::Malformed(format!("owned objects for {}: {}", owner, e)))?;

        let mut records = Vec::with_capacity(page.data.len());
        for (position, item) in page.data.into_iter().enumerate() {
            let object_id = item
                .pointer("/data/objectId")
                .and_then(Value::as_str)
                .map(str::to_string);
            match serde_json::from_value::<OwnedObject>(item) {
                Ok(OwnedObject { data: Some(object) }) => records.push(Self::to_record(object)),
                outcome => {
                    let id = object_id
                        .unwrap_or_else(|| RawRecord::anonymous_id(owner, cursor, position));
                    match outcome {
                        Err(e) => tracing::warn!("unparsable object {} for {}: {}", id, owner, e),
                        Ok(_) => tracing::debug!("object {} for {} has no data", id, owner),
                    }
                    records.push(RawRecord::placeholder(id));
                }
            }
        }
        let next_cursor = if page.has_next_page {
            page.next_cursor
        } else {
            None
        };

        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Bytes> {
        let url = format!("{}/v1/blobs/{}", self.aggregator_url, id);
        tracing::info!("downloading blob {} from aggregator", id);
        let start_time = Instant::now();

        let bytes = self
            .retry
            .run("blob download", || {
                let client = self.http.clone();
                let url = url.clone();
                async move {
                    let response = client.get(&url).timeout(BLOB_TIMEOUT).send().await?;
                    if !response.status().is_success() {
                        return Err(classify_status(response.status(), "blob download"));
                    }
                    Ok(response.bytes().await?)
                }
            })
            .await?;

        let elapsed = start_time.elapsed();
        tracing::info!(
            "downloaded blob {} in {:.2}s ({} bytes)",
            id,
            elapsed.as_secs_f64(),
            bytes.len()
        );
        Ok(bytes)
    }

    async fn store_blob(&self, data: &[u8]) -> Result<String> {
        let publisher = self.publisher_url.as_deref().ok_or_else(|| {
            Error::NotAuthorized("no blob publisher configured".to_string())
        })?;
        let url = format!("{}/v1/blobs?epochs={}", publisher, self.epochs);
        let body = Bytes::copy_from_slice(data);

        let response: Value = self
            .retry
            .run("blob upload", || {
                let client = self.http.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let response = client.put(&url).timeout(BLOB_TIMEOUT).body(body).send().await?;
                    if !response.status().is_success() {
                        return Err(classify_status(response.status(), "blob upload"));
                    }
                    Ok(response.json::<Value>().await?)
                }
            })
            .await?;

        let parsed = parse_with(&response, BLOB_ID_STRATEGIES, "blob store response")?;
        tracing::info!(
            "stored {} bytes as blob {} ({})",
            data.len(),
            parsed.value,
            parsed.strategy
        );
        Ok(parsed.value)
    }

    async fn write(&self, request: WriteRequest) -> Result<WriteRef> {
        let signer = self.ensure_writer_ready().await?;
        let checkpoint = self.current_height().await.map_err(|e| match e {
            Error::Rejected(reason) => Error::Unavailable(reason),
            other => other,
        })?;
        let anchor = checkpoint.to_string();

        let signed = signer
            .sign(SignRequest {
                destination: &request.address,
                payload: &request.payload,
                anchor: &anchor,
                content_ref: request.content_ref.as_deref(),
            })
            .await?;

        let result = self
            .rpc
            .call(
                "sui_executeTransactionBlock",
                json!([
                    signed.transaction,
                    signed.signatures,
                    {"showEffects": true},
                    "WaitForLocalExecution",
                ]),
            )
            .await?;
        let digest = parse_with(&result, REFERENCE_STRATEGIES, "transaction digest")?.value;

        tracing::debug!("wrote record object for {} in {}", request.address, digest);
        Ok(WriteRef(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SignedTransaction;
    use crate::record::{Checksum, Header};
    use httpmock::prelude::*;

    struct FakeSigner;

    #[async_trait]
    impl TransactionSigner for FakeSigner {
        fn writer_address(&self) -> String {
            "0xpublisher".to_string()
        }

        async fn is_unlocked(&self) -> bool {
            true
        }

        async fn sign(&self, request: SignRequest<'_>) -> Result<SignedTransaction> {
            Ok(SignedTransaction {
                transaction: format!(
                    "tx:{}:{}",
                    request.anchor,
                    request.content_ref.unwrap_or("-")
                ),
                signatures: vec!["sig".into()],
            })
        }
    }

    fn driver(server: &MockServer) -> ObjectLedgerDriver {
        let rpc = JsonRpcClient::new(
            &server.url("/rpc"),
            Duration::from_secs(5),
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
        .unwrap();
        ObjectLedgerDriver::new(rpc, &server.base_url(), "0xpkg", Some(Arc::new(FakeSigner)))
            .with_publisher(Some(server.base_url()), 3)
    }

    #[tokio::test]
    async fn owned_objects_become_records() {
        let server = MockServer::start_async().await;
        let header = Header {
            schema: 1,
            platform: 2,
            chunk_size: 51,
            flags: 0,
            cartridge_id: 11,
            total_size: 1000,
            checksum: Checksum::compute(b"x"),
        };
        let record_hex = hex::encode(header.encode().unwrap());
        server.mock(|when, then| {
            when.method(POST)
                .path("/rpc")
                .json_body_partial(r#"{"method": "suix_getOwnedObjects"}"#);
            then.status(200).json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "data": [{"data": {
                        "objectId": "0xobj1",
                        "version": "77",
                        "content": {"fields": {
                            "record": record_hex,
                            "blob_id": "BLOB1",
                            "publisher": "0xpublisher"
                        }}
                    }}],
                    "nextCursor": "0xobj1",
                    "hasNextPage": false
                }
            }));
        });

        let page = driver(&server).fetch_page("0xcart", 10, None).await.unwrap();
        assert!(page.next_cursor.is_none());
        let record = &page.records[0];
        assert_eq!(record.id, "0xobj1");
        assert_eq!(record.height, 77);
        assert_eq!(record.content_ref.as_deref(), Some("BLOB1"));
        assert!(record.is_from("0xPUBLISHER"));
        assert_eq!(Header::decode(&record.payload).unwrap(), header);
    }

    #[tokio::test]
    async fn unreadable_objects_keep_their_slot() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST)
                .path("/rpc")
                .json_body_partial(r#"{"method": "suix_getOwnedObjects"}"#);
            then.status(200).json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "data": [
                        {"data": {"objectId": "0xgood", "version": 3}},
                        {"data": {"objectId": "0xbad", "content": "not an object"}},
                        {"error": {"code": "deleted"}},
                    ],
                    "nextCursor": "0xcursor",
                    "hasNextPage": true
                }
            }));
        });

        let page = driver(&server).fetch_page("0xcart", 3, None).await.unwrap();
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.records[0].id, "0xgood");
        assert_eq!(page.records[1].id, "0xbad");
        assert!(page.records[1].payload.is_empty());
        assert_eq!(page.records[2].id, RawRecord::anonymous_id("0xcart", None, 2));
        assert_eq!(page.next_cursor.as_deref(), Some("0xcursor"));
    }

    #[tokio::test]
    async fn blob_download_retries_server_errors() {
        let server = MockServer::start_async().await;
        let failing = server.mock(|when, then| {
            when.method(GET).path("/v1/blobs/BAD");
            then.status(502);
        });
        let ok = server.mock(|when, then| {
            when.method(GET).path("/v1/blobs/GOOD");
            then.status(200).body("cartridge bytes");
        });

        let driver = driver(&server);
        assert_eq!(&driver.fetch_by_id("GOOD").await.unwrap()[..], b"cartridge bytes");
        ok.assert();
        assert!(driver.fetch_by_id("BAD").await.unwrap_err().is_transient());
        failing.assert_hits(2);
    }

    #[tokio::test]
    async fn store_blob_accepts_both_response_shapes() {
        let server = MockServer::start_async().await;
        let fresh = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/blobs")
                .query_param("epochs", "3")
                .body("new");
            then.status(200)
                .json_body(json!({"newlyCreated": {"blobObject": {"blobId": "B-NEW"}}}));
        });
        server.mock(|when, then| {
            when.method(PUT).path("/v1/blobs").body("old");
            then.status(200)
                .json_body(json!({"alreadyCertified": {"blobId": "B-OLD", "endEpoch": 9}}));
        });

        let driver = driver(&server);
        assert_eq!(driver.store_blob(b"new").await.unwrap(), "B-NEW");
        assert_eq!(driver.store_blob(b"old").await.unwrap(), "B-OLD");
        fresh.assert();
    }

    #[tokio::test]
    async fn write_passes_blob_reference_to_signer() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST)
                .path("/rpc")
                .json_body_partial(r#"{"method": "sui_getLatestCheckpointSequenceNumber"}"#);
            then.status(200)
                .json_body(json!({"jsonrpc": "2.0", "id": 1, "result": "500"}));
        });
        let execute = server.mock(|when, then| {
            when.method(POST)
                .path("/rpc")
                .json_body_partial(r#"{"method": "sui_executeTransactionBlock"}"#)
                .body_contains("tx:500:BLOB7");
            then.status(200)
                .json_body(json!({"jsonrpc": "2.0", "id": 2, "result": {"digest": "DIGEST1"}}));
        });

        let request = WriteRequest {
            address: "0xcart".into(),
            payload: vec![0; 64],
            content_ref: None,
        }
        .with_content_ref("BLOB7");
        let reference = driver(&server).write(request).await.unwrap();
        assert_eq!(reference.0, "DIGEST1");
        execute.assert();
    }

    #[test]
    fn addresses_are_32_byte_hex() {
        let rpc = JsonRpcClient::new("http://localhost:1", Duration::from_secs(1), RetryPolicy::none())
            .unwrap();
        let driver = ObjectLedgerDriver::new(rpc, "http://localhost:2", "0xpkg", None);
        let address = driver.address_for_key(&CartridgeKey::derive(0, 1));
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 66);
        assert_eq!(driver.storage_mode(), StorageMode::Blob);
    }
}
