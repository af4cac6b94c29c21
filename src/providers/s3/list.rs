use crate::providers::s3_client::S3Result;
use crate::providers::ObjectEntry;
use aws_sdk_s3::Client;
use serde_json::json;

pub async fn list_buckets(client: &Client) -> S3Result<Vec<String>> {
    let response = client.list_buckets().send().await?;

    let buckets = response
        .buckets()
        .iter()
        .filter_map(|bucket| bucket.name().map(|name| name.to_string()))
        .collect();

    Ok(buckets)
}

/// Page through the whole bucket. Zero-byte "folder/" placeholder objects
/// are kept: the directory model treats a trailing slash as an empty folder.
pub async fn list_all_objects(client: &Client, bucket: &str) -> S3Result<Vec<ObjectEntry>> {
    let mut all_objects: Vec<ObjectEntry> = Vec::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let mut request = client.list_objects_v2().bucket(bucket).max_keys(1000);

        if let Some(token) = &continuation_token {
            request = request.continuation_token(token);
        }

        let response = request.send().await?;
        let is_truncated = response.is_truncated().unwrap_or(false);
        let next_token = response.next_continuation_token().map(|s| s.to_string());

        all_objects.extend(response.contents().iter().filter_map(|obj| {
            let key = obj.key()?.to_string();
            Some(
                ObjectEntry::new(
                    key,
                    obj.size().unwrap_or(0).max(0) as u64,
                    obj.last_modified().map(|dt| dt.secs()).unwrap_or(0),
                )
                .with_meta(json!({
                    "etag": obj.e_tag().unwrap_or_default(),
                    "storage_class": obj.storage_class().map(|c| c.as_str().to_string()),
                })),
            )
        }));

        log::debug!("s3: listed {} objects from {}", all_objects.len(), bucket);

        if !is_truncated || next_token.is_none() {
            break;
        }
        continuation_token = next_token;
    }

    Ok(all_objects)
}
