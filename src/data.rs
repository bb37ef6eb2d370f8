use std::sync::Arc;

use crate::instagram::{self, ApiResult};

/// Everything the feed synchronizer needs from the network.
pub trait FeedService: Send + Sync {
    fn load_profile(&self) -> ApiResult<instagram::Profile>;
    fn load_media(&self) -> ApiResult<Vec<instagram::MediaItem>>;
    fn load_comments(&self, media_id: &str) -> ApiResult<Vec<instagram::Comment>>;
    fn load_replies(&self, comment_id: &str) -> ApiResult<Vec<instagram::Reply>>;
    fn create_comment(&self, media_id: &str, text: &str) -> ApiResult<instagram::Comment>;
    fn create_reply(
        &self,
        media_id: &str,
        comment_id: &str,
        text: &str,
    ) -> ApiResult<instagram::Reply>;
}

pub struct InstagramFeedService {
    client: Arc<instagram::Client>,
}

impl InstagramFeedService {
    pub fn new(client: Arc<instagram::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for InstagramFeedService {
    fn load_profile(&self) -> ApiResult<instagram::Profile> {
        self.client.profile()
    }

    fn load_media(&self) -> ApiResult<Vec<instagram::MediaItem>> {
        self.client.media()
    }

    fn load_comments(&self, media_id: &str) -> ApiResult<Vec<instagram::Comment>> {
        self.client.comments(media_id)
    }

    fn load_replies(&self, comment_id: &str) -> ApiResult<Vec<instagram::Reply>> {
        self.client.replies(comment_id)
    }

    fn create_comment(&self, media_id: &str, text: &str) -> ApiResult<instagram::Comment> {
        self.client.create_comment(media_id, text)
    }

    fn create_reply(
        &self,
        media_id: &str,
        comment_id: &str,
        text: &str,
    ) -> ApiResult<instagram::Reply> {
        self.client.reply_to_comment(media_id, comment_id, text)
    }
}
