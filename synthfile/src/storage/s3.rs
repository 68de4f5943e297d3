use super::{Reference, Result, StorageBackend, StorageError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client,
    config::Region,
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use bytes::Bytes;
use std::time::Duration;
use url::Url;

/// Bodies up to this size go up in a single `PutObject`; larger ones use multipart upload
/// with parts of this size. S3 requires every part but the last to be at least 5 MiB.
const PART_SIZE: u64 = 8 * 1024 * 1024;

const CONTENT_TYPE: &str = "application/octet-stream";

fn s3_error(operation: &'static str, err: impl std::error::Error) -> StorageError {
    StorageError::S3 {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

/// S3 (or S3-compatible) storage backend. Object keys are the file names.
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Build a client from the default AWS provider chain, overridden by whatever is configured
    pub async fn connect(
        bucket: String,
        region: Option<String>,
        credentials: Option<(String, String)>,
        endpoint_url: Option<&Url>,
        force_path_style: bool,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        if let Some((access_key_id, secret_access_key)) = credentials {
            loader = loader.credentials_provider(Credentials::new(access_key_id, secret_access_key, None, None, "synthfile-config"));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(force_path_style);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint.as_str());
        }

        tracing::info!("Using S3 bucket: {}", bucket);
        Self::new(Client::from_conf(builder.build()), bucket)
    }

    async fn put_single(&self, name: &str, body: Bytes) -> Result<()> {
        let len = body.len() as i64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .content_type(CONTENT_TYPE)
            .content_length(len)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| s3_error("put_object", e))?;
        Ok(())
    }

    async fn put_multipart(&self, name: &str, len: u64) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| s3_error("create_multipart_upload", e))?;
        let upload_id = upload.upload_id().ok_or_else(|| StorageError::S3 {
            operation: "create_multipart_upload",
            message: "response carried no upload id".to_string(),
        })?;

        match self.upload_parts(name, upload_id, len).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(name)
                    .upload_id(upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send()
                    .await
                    .map_err(|e| s3_error("complete_multipart_upload", e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(name)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        "Failed to abort multipart upload {} for {}: {}",
                        upload_id,
                        name,
                        DisplayErrorContext(abort)
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, name: &str, upload_id: &str, len: u64) -> Result<Vec<CompletedPart>> {
        // Every part is a slice of the same buffer, so memory use stays at one part
        let zeroes = Bytes::from(vec![0u8; PART_SIZE as usize]);
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;

        while offset < len {
            let part_len = PART_SIZE.min(len - offset);
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(name)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(part_len as i64)
                .body(ByteStream::from(zeroes.slice(..part_len as usize)))
                .send()
                .await
                .map_err(|e| s3_error("upload_part", e))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );

            tracing::debug!(key = name, part_number, part_len, "Uploaded part");
            offset += part_len;
            part_number += 1;
        }

        Ok(parts)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(name).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(s3_error("head_object", err))
                }
            }
        }
    }

    async fn write_zeroes(&self, name: &str, len: u64) -> Result<()> {
        if len <= PART_SIZE {
            self.put_single(name, Bytes::from(vec![0u8; len as usize])).await
        } else {
            self.put_multipart(name, len).await
        }
    }

    async fn reference(&self, name: &str, ttl: Duration) -> Result<Reference> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| s3_error("presign", e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .presigned(presigning)
            .await
            .map_err(|e| s3_error("presign", e))?;
        Ok(Reference::Url(request.uri().to_string()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pages = self.client.list_objects_v2().bucket(&self.bucket).into_paginator().send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| s3_error("list_objects_v2", e))?;
            names.extend(page.contents().iter().filter_map(|object| object.key().map(str::to_string)));
        }

        Ok(names)
    }

    fn describe(&self) -> String {
        format!("S3 bucket {}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_s3_storage;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_storage(server: &MockServer) -> S3Storage {
        create_test_s3_storage(&server.uri(), "test-bucket")
    }

    #[tokio::test]
    async fn test_exists_maps_head_responses() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/test-bucket/5KB.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "5120"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/test-bucket/7KB.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = test_storage(&server);

        assert!(storage.exists("5KB.bin").await.unwrap());
        assert!(!storage.exists("7KB.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_surfaces_other_failures() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/test-bucket/5KB.bin"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let storage = test_storage(&server);

        let result = storage.exists("5KB.bin").await;
        assert!(matches!(result, Err(StorageError::S3 { operation: "head_object", .. })));
    }

    #[tokio::test]
    async fn test_small_write_is_a_single_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/test-bucket/5KB.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"abc\""))
            .expect(1)
            .mount(&server)
            .await;

        let storage = test_storage(&server);
        storage.write_zeroes("5KB.bin", 5120).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_collects_keys() {
        let server = MockServer::start().await;
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>test-bucket</Name>
  <Prefix></Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>10KB.bin</Key><Size>10240</Size></Contents>
  <Contents><Key>5KB.bin</Key><Size>5120</Size></Contents>
</ListBucketResult>"#;
        Mock::given(method("GET"))
            .and(path("/test-bucket/"))
            .and(query_param("list-type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/xml"))
            .mount(&server)
            .await;

        let storage = test_storage(&server);

        let names = storage.list().await.unwrap();
        assert_eq!(names, vec!["10KB.bin".to_string(), "5KB.bin".to_string()]);
    }

    const INITIATE_UPLOAD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>test-bucket</Bucket>
  <Key>9000KB.bin</Key>
  <UploadId>upload-1</UploadId>
</InitiateMultipartUploadResult>"#;

    async fn mount_initiate_upload(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/test-bucket/9000KB.bin"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_raw(INITIATE_UPLOAD, "application/xml"))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_large_write_uses_multipart_upload() {
        let server = MockServer::start().await;
        mount_initiate_upload(&server).await;

        // 9000 KiB is one full 8 MiB part plus a remainder
        Mock::given(method("PUT"))
            .and(path("/test-bucket/9000KB.bin"))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"part\""))
            .expect(2)
            .mount(&server)
            .await;

        let complete = r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>test-bucket</Bucket>
  <Key>9000KB.bin</Key>
  <ETag>"done-2"</ETag>
</CompleteMultipartUploadResult>"#;
        Mock::given(method("POST"))
            .and(path("/test-bucket/9000KB.bin"))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(complete, "application/xml"))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let storage = test_storage(&server);
        storage.write_zeroes("9000KB.bin", 9000 * 1024).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_part_aborts_multipart_upload() {
        let server = MockServer::start().await;
        mount_initiate_upload(&server).await;

        Mock::given(method("PUT"))
            .and(path("/test-bucket/9000KB.bin"))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/test-bucket/9000KB.bin"))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let storage = test_storage(&server);
        let result = storage.write_zeroes("9000KB.bin", 9000 * 1024).await;

        assert!(matches!(result, Err(StorageError::S3 { operation: "upload_part", .. })));
    }

    #[tokio::test]
    async fn test_reference_is_presigned_url() {
        // Presigning is local; the server is only there to provide an endpoint
        let server = MockServer::start().await;
        let storage = test_storage(&server);

        let reference = storage.reference("5KB.bin", Duration::from_secs(60)).await.unwrap();

        let Reference::Url(url) = reference else {
            panic!("expected a URL reference");
        };
        assert!(url.starts_with(&format!("{}/test-bucket/5KB.bin?", server.uri())));
        assert!(url.contains("X-Amz-Expires=60"));
        assert!(url.contains("X-Amz-Signature="));
    }
}
