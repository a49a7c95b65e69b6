use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;

use super::object_store::{ObjectPage, ObjectStore, Precondition, StoreError, StoredObject};

pub struct S3ObjectStore {
    bucket: String,
    s3_client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(bucket: impl Into<String>, s3_client: aws_sdk_s3::Client) -> Self {
        Self {
            bucket: bucket.into(),
            s3_client,
        }
    }
}

/// Maps an HTTP status from S3 onto the store taxonomy. 409 is S3's answer
/// to two conditional writes racing on one key and is worth retrying.
pub fn classify_status(status: u16, key: &str, detail: String) -> StoreError {
    match status {
        404 => StoreError::NotFound(key.to_string()),
        412 => StoreError::PreconditionFailed(key.to_string()),
        408 | 409 | 429 | 500 | 502 | 503 | 504 => StoreError::Transient(detail),
        _ => StoreError::Fatal(detail),
    }
}

fn classify_sdk_error<E>(error: SdkError<E, HttpResponse>, key: &str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{}", DisplayErrorContext(&error));
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(detail)
        }
        SdkError::ServiceError(context) => {
            classify_status(context.raw().status().as_u16(), key, detail)
        }
        _ => StoreError::Fatal(detail),
    }
}

impl ObjectStore for S3ObjectStore {
    fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let bucket = self.bucket.clone();
        let object_key = key.to_string();
        let client = self.s3_client.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let output = client
                    .get_object()
                    .bucket(bucket)
                    .key(&object_key)
                    .send()
                    .await
                    .map_err(|error| classify_sdk_error(error, &object_key))?;
                let etag = output.e_tag().unwrap_or_default().to_string();
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|error| {
                        StoreError::Transient(format!("failed to read {object_key}: {error}"))
                    })?
                    .into_bytes()
                    .to_vec();
                Ok(StoredObject { body, etag })
            })
        })
    }

    fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: &Precondition,
    ) -> Result<String, StoreError> {
        let bucket = self.bucket.clone();
        let object_key = key.to_string();
        let body_bytes = body.to_vec();
        let client = self.s3_client.clone();
        let precondition = precondition.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let mut request = client
                    .put_object()
                    .bucket(bucket)
                    .key(&object_key)
                    .content_type("application/json")
                    .body(ByteStream::from(body_bytes));
                request = match precondition {
                    Precondition::None => request,
                    Precondition::IfAbsent => request.if_none_match("*"),
                    Precondition::IfMatch(etag) => request.if_match(etag),
                };
                request
                    .send()
                    .await
                    .map(|output| output.e_tag().unwrap_or_default().to_string())
                    .map_err(|error| classify_sdk_error(error, &object_key))
            })
        })
    }

    fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        let bucket = self.bucket.clone();
        let key_prefix = prefix.to_string();
        let continuation = continuation.map(str::to_string);
        let client = self.s3_client.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let output = client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(&key_prefix)
                    .set_continuation_token(continuation)
                    .send()
                    .await
                    .map_err(|error| classify_sdk_error(error, &key_prefix))?;
                let keys = output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string))
                    .collect();
                let continuation = if output.is_truncated().unwrap_or(false) {
                    output.next_continuation_token().map(str::to_string)
                } else {
                    None
                };
                Ok(ObjectPage { keys, continuation })
            })
        })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let bucket = self.bucket.clone();
        let object_key = key.to_string();
        let client = self.s3_client.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                client
                    .delete_object()
                    .bucket(bucket)
                    .key(&object_key)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|error| classify_sdk_error(error, &object_key))
            })
        })
    }
}
