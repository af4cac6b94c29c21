use crate::providers::s3_client::S3Result;
use aws_sdk_s3::Client;

pub async fn delete_object(client: &Client, bucket: &str, key: &str) -> S3Result<()> {
    client
        .delete_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await?;
    Ok(())
}
