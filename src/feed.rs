//! Feed synchronization: fetches profile, media and comment threads into a
//! single [`ViewState`] and applies user mutations to it.
//!
//! Network calls never run while the state lock is held. Every write to a
//! media's comment list goes through [`Arc::make_mut`], so snapshots handed
//! out earlier keep seeing the list they were given.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use parking_lot::RwLock;

use crate::data::FeedService;
use crate::instagram::{ApiError, ApiResult, Comment, ErrorKind, MediaItem, Profile, Reply};
use crate::session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Ready,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    fn toggled(self) -> Self {
        match self {
            Visibility::Visible => Visibility::Hidden,
            Visibility::Hidden => Visibility::Visible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RepliesState {
    #[default]
    NotLoaded,
    Loading,
    Loaded {
        replies: Vec<Reply>,
        visibility: Visibility,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread {
    pub comment: Comment,
    pub replies: RepliesState,
    // Replies posted here before the thread's replies were fetched.
    unsynced: Vec<Reply>,
}

impl CommentThread {
    pub fn new(comment: Comment) -> Self {
        Self {
            comment,
            replies: RepliesState::NotLoaded,
            unsynced: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.comment.id
    }

    pub fn replies_loaded(&self) -> bool {
        matches!(self.replies, RepliesState::Loaded { .. })
    }

    pub fn replies_visible(&self) -> bool {
        matches!(
            self.replies,
            RepliesState::Loaded {
                visibility: Visibility::Visible,
                ..
            }
        )
    }

    pub fn replies_loading(&self) -> bool {
        matches!(self.replies, RepliesState::Loading)
    }

    /// Loaded replies, oldest first. Empty until the thread is expanded.
    pub fn replies(&self) -> &[Reply] {
        match &self.replies {
            RepliesState::Loaded { replies, .. } => replies,
            _ => &[],
        }
    }

    fn append_reply(&mut self, reply: Reply) {
        match &mut self.replies {
            RepliesState::Loaded { replies, .. } => {
                if !replies.iter().any(|existing| existing.id == reply.id) {
                    replies.push(reply);
                }
            }
            _ => {
                if !self.unsynced.iter().any(|existing| existing.id == reply.id) {
                    self.unsynced.push(reply);
                }
            }
        }
    }

    fn finish_loading(&mut self, mut fetched: Vec<Reply>) {
        for reply in self.unsynced.drain(..) {
            if !fetched.iter().any(|existing| existing.id == reply.id) {
                fetched.push(reply);
            }
        }
        self.replies = RepliesState::Loaded {
            replies: fetched,
            visibility: Visibility::Visible,
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// The initial load failed; nothing trustworthy is on screen.
    Page,
    /// A single post or expand failed; the rest of the feed is intact.
    Scoped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewError {
    pub kind: ErrorKind,
    pub scope: ErrorScope,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDraft {
    pub media_id: String,
    pub comment_id: String,
    pub text: String,
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub phase: Phase,
    pub profile: Option<Arc<Profile>>,
    pub media_items: Arc<Vec<MediaItem>>,
    pub comments_by_media_id: HashMap<String, Arc<Vec<CommentThread>>>,
    pub pending_error: Option<ViewError>,
    pub reply_draft: Option<ReplyDraft>,
}

impl ViewState {
    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Loading
    }

    pub fn comments(&self, media_id: &str) -> &[CommentThread] {
        self.comments_by_media_id
            .get(media_id)
            .map(|threads| threads.as_slice())
            .unwrap_or(&[])
    }

    pub fn thread(&self, media_id: &str, comment_id: &str) -> Option<&CommentThread> {
        self.comments(media_id)
            .iter()
            .find(|thread| thread.id() == comment_id)
    }

    fn thread_mut(&mut self, media_id: &str, comment_id: &str) -> Option<&mut CommentThread> {
        let threads = self.comments_by_media_id.get_mut(media_id)?;
        let index = threads.iter().position(|thread| thread.id() == comment_id)?;
        Arc::make_mut(threads).get_mut(index)
    }

    fn has_media(&self, media_id: &str) -> bool {
        self.media_items.iter().any(|item| item.id == media_id)
    }

    fn record(&mut self, err: &SyncError, scope: ErrorScope, message: &str) {
        self.pending_error = Some(ViewError {
            kind: err.kind(),
            scope,
            message: message.to_string(),
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },
    #[error("cannot {action} while {phase:?}")]
    InvalidState { action: &'static str, phase: Phase },
    /// The feed was reset or reloaded while the request was in flight; its
    /// result was discarded.
    #[error("superseded by a newer feed")]
    Superseded,
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotAuthenticated => ErrorKind::Authorization,
            SyncError::NotFound { .. }
            | SyncError::InvalidState { .. }
            | SyncError::Superseded => ErrorKind::Validation,
            SyncError::Api(err) => err.kind(),
        }
    }

    fn is_unauthorized(&self) -> bool {
        matches!(self, SyncError::Api(err) if err.is_unauthorized())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

struct Inner {
    view: ViewState,
    // Bumped whenever the feed is replaced, so late results from an older
    // load or expand are dropped instead of applied.
    generation: u64,
}

struct Loaded {
    profile: Profile,
    media: Vec<MediaItem>,
    comments: HashMap<String, Arc<Vec<CommentThread>>>,
    comments_unauthorized: bool,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Upper bound on concurrent comment fetches during a load.
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

pub struct Synchronizer {
    service: Arc<dyn FeedService>,
    session: Arc<session::Manager>,
    options: Options,
    inner: RwLock<Inner>,
}

impl Synchronizer {
    pub fn new(service: Arc<dyn FeedService>, session: Arc<session::Manager>) -> Self {
        Self::with_options(service, session, Options::default())
    }

    pub fn with_options(
        service: Arc<dyn FeedService>,
        session: Arc<session::Manager>,
        options: Options,
    ) -> Self {
        let mut options = options;
        if options.workers == 0 {
            options.workers = Options::default().workers;
        }
        Self {
            service,
            session,
            options,
            inner: RwLock::new(Inner {
                view: ViewState::default(),
                generation: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> ViewState {
        self.inner.read().view.clone()
    }

    /// Fetches profile, media and every media's comments, then swaps them into
    /// the view in one step. Issues nothing when signed out.
    pub fn load_all(&self) -> SyncResult<()> {
        if !self.session.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }

        let generation = {
            let mut inner = self.inner.write();
            inner.generation += 1;
            inner.view.phase = Phase::Loading;
            inner.view.pending_error = None;
            inner.generation
        };
        tracing::debug!(generation, "loading feed");

        let outcome = self.fetch_feed();
        let unauthorized = match &outcome {
            Ok(loaded) => loaded.comments_unauthorized,
            Err(err) => err.is_unauthorized(),
        };
        if unauthorized {
            self.session.notify_unauthorized();
        }

        let mut inner = self.inner.write();
        if inner.generation != generation {
            tracing::debug!(
                generation,
                failed = outcome.is_err(),
                "feed load superseded; dropping result"
            );
            return Err(SyncError::Superseded);
        }

        match outcome {
            Ok(loaded) => {
                tracing::info!(
                    media = loaded.media.len(),
                    username = %loaded.profile.username,
                    "feed loaded"
                );
                let view = &mut inner.view;
                view.profile = Some(Arc::new(loaded.profile));
                view.media_items = Arc::new(loaded.media);
                view.comments_by_media_id = loaded.comments;
                view.phase = Phase::Ready;
                view.reply_draft = None;
                if loaded.comments_unauthorized {
                    view.pending_error = Some(ViewError {
                        kind: ErrorKind::Authorization,
                        scope: ErrorScope::Scoped,
                        message: "session expired; sign in again".into(),
                    });
                }
                Ok(())
            }
            Err(err) => {
                let err = SyncError::from(err);
                tracing::warn!(error = %err, "feed load failed");
                inner.view.phase = Phase::Errored;
                let message = err.to_string();
                inner.view.record(&err, ErrorScope::Page, &message);
                Err(err)
            }
        }
    }

    /// Re-runs the initial load after it failed.
    pub fn retry(&self) -> SyncResult<()> {
        let phase = self.inner.read().view.phase;
        if phase != Phase::Errored {
            return Err(SyncError::InvalidState {
                action: "retry",
                phase,
            });
        }
        self.load_all()
    }

    /// First call fetches and shows the replies; later calls only toggle
    /// their visibility. A call while the fetch is in flight does nothing.
    pub fn expand_replies(&self, media_id: &str, comment_id: &str) -> SyncResult<()> {
        let generation = {
            let mut inner = self.inner.write();
            let generation = inner.generation;
            let thread = inner
                .view
                .thread_mut(media_id, comment_id)
                .ok_or_else(|| SyncError::NotFound {
                    what: "comment",
                    id: comment_id.to_string(),
                })?;
            match &mut thread.replies {
                RepliesState::Loading => return Ok(()),
                RepliesState::Loaded { visibility, .. } => {
                    *visibility = visibility.toggled();
                    return Ok(());
                }
                RepliesState::NotLoaded => {}
            }
            thread.replies = RepliesState::Loading;
            generation
        };

        let result = self.service.load_replies(comment_id);
        if matches!(&result, Err(err) if err.is_unauthorized()) {
            self.session.notify_unauthorized();
        }

        let mut inner = self.inner.write();
        if inner.generation != generation {
            tracing::debug!(comment_id, "replies arrived for a replaced feed; dropping");
            return Err(SyncError::Superseded);
        }
        let Some(thread) = inner.view.thread_mut(media_id, comment_id) else {
            return Ok(());
        };
        if !thread.replies_loading() {
            return Ok(());
        }

        match result {
            Ok(replies) => {
                tracing::debug!(comment_id, count = replies.len(), "replies loaded");
                thread.finish_loading(replies);
                Ok(())
            }
            Err(err) => {
                thread.replies = RepliesState::NotLoaded;
                let err = SyncError::from(err);
                tracing::warn!(comment_id, error = %err, "loading replies failed");
                inner
                    .view
                    .record(&err, ErrorScope::Scoped, "failed to load replies");
                Err(err)
            }
        }
    }

    /// Posts a comment and appends the server's copy once it is confirmed.
    /// Blank text is ignored without contacting the server.
    pub fn post_comment(&self, media_id: &str, text: &str) -> SyncResult<Option<Comment>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        if !self.session.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        let generation = {
            let mut inner = self.inner.write();
            if !inner.view.has_media(media_id) {
                let err = SyncError::NotFound {
                    what: "media",
                    id: media_id.to_string(),
                };
                inner
                    .view
                    .record(&err, ErrorScope::Scoped, "failed to post comment");
                return Err(err);
            }
            inner.generation
        };

        let comment = match self.service.create_comment(media_id, text) {
            Ok(comment) => comment,
            Err(err) => return Err(self.mutation_failed(err, "failed to post comment")),
        };

        let mut inner = self.inner.write();
        if inner.generation == generation {
            let threads = inner
                .view
                .comments_by_media_id
                .entry(media_id.to_string())
                .or_default();
            if !threads.iter().any(|thread| thread.id() == comment.id) {
                Arc::make_mut(threads).push(CommentThread::new(comment.clone()));
            }
        }
        tracing::info!(media_id, comment_id = %comment.id, "comment posted");
        Ok(Some(comment))
    }

    /// Posts a reply under `comment_id`. Blank text or a missing target is
    /// ignored; a target that is not in the feed is an error and nothing is
    /// sent.
    pub fn post_reply(
        &self,
        media_id: &str,
        comment_id: &str,
        text: &str,
    ) -> SyncResult<Option<Reply>> {
        let text = text.trim();
        if text.is_empty() || comment_id.is_empty() {
            return Ok(None);
        }
        if !self.session.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        let generation = {
            let mut inner = self.inner.write();
            if inner.view.thread(media_id, comment_id).is_none() {
                let err = SyncError::NotFound {
                    what: "comment",
                    id: comment_id.to_string(),
                };
                inner
                    .view
                    .record(&err, ErrorScope::Scoped, "failed to post reply");
                return Err(err);
            }
            inner.generation
        };

        let reply = match self.service.create_reply(media_id, comment_id, text) {
            Ok(reply) => reply,
            Err(err) => return Err(self.mutation_failed(err, "failed to post reply")),
        };

        let mut inner = self.inner.write();
        if inner.generation == generation {
            match inner.view.thread_mut(media_id, comment_id) {
                Some(thread) => thread.append_reply(reply.clone()),
                None => tracing::warn!(comment_id, "replied comment vanished from the feed"),
            }
        }
        let targeted = inner
            .view
            .reply_draft
            .as_ref()
            .is_some_and(|draft| draft.media_id == media_id && draft.comment_id == comment_id);
        if targeted {
            inner.view.reply_draft = None;
        }
        tracing::info!(media_id, comment_id, reply_id = %reply.id, "reply posted");
        Ok(Some(reply))
    }

    /// Targets a comment for reply. Re-targeting the same comment keeps the
    /// text typed so far.
    pub fn begin_reply(&self, media_id: &str, comment_id: &str) {
        let mut inner = self.inner.write();
        let same = inner
            .view
            .reply_draft
            .as_ref()
            .is_some_and(|draft| draft.media_id == media_id && draft.comment_id == comment_id);
        if !same {
            inner.view.reply_draft = Some(ReplyDraft {
                media_id: media_id.to_string(),
                comment_id: comment_id.to_string(),
                text: String::new(),
            });
        }
    }

    pub fn update_reply_text(&self, text: &str) {
        if let Some(draft) = self.inner.write().view.reply_draft.as_mut() {
            draft.text = text.to_string();
        }
    }

    pub fn cancel_reply(&self) {
        self.inner.write().view.reply_draft = None;
    }

    /// Posts the current draft. The draft survives a failure so it can be
    /// retried as is.
    pub fn submit_reply(&self) -> SyncResult<Option<Reply>> {
        let Some(draft) = self.inner.read().view.reply_draft.clone() else {
            return Ok(None);
        };
        self.post_reply(&draft.media_id, &draft.comment_id, &draft.text)
    }

    pub fn dismiss_error(&self) {
        self.inner.write().view.pending_error = None;
    }

    /// Forgets everything, e.g. after sign-out. Late results of requests
    /// still in flight are dropped.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.generation += 1;
        inner.view = ViewState::default();
    }

    fn mutation_failed(&self, err: ApiError, message: &str) -> SyncError {
        let err = SyncError::from(err);
        tracing::warn!(error = %err, "{message}");
        if err.is_unauthorized() {
            self.session.notify_unauthorized();
        }
        self.inner
            .write()
            .view
            .record(&err, ErrorScope::Scoped, message);
        err
    }

    fn fetch_feed(&self) -> ApiResult<Loaded> {
        let service = &self.service;
        let (profile, media) = thread::scope(|scope| {
            let profile = scope.spawn(|| service.load_profile());
            let media = service.load_media();
            let profile = profile
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (profile, media)
        });

        let (profile, media) = match (profile, media) {
            (Ok(profile), Ok(media)) => (profile, media),
            (Err(ApiError::Unauthorized), _) | (_, Err(ApiError::Unauthorized)) => {
                return Err(ApiError::Unauthorized)
            }
            (Err(err), _) | (_, Err(err)) => return Err(err),
        };

        let (comments, comments_unauthorized) = self.fetch_comments(&media);
        Ok(Loaded {
            profile,
            media,
            comments,
            comments_unauthorized,
        })
    }

    /// At most `options.workers` fetches run at once; a failed fetch leaves
    /// that item with no comments. Results are keyed by media id, so arrival
    /// order is irrelevant.
    fn fetch_comments(
        &self,
        media: &[MediaItem],
    ) -> (HashMap<String, Arc<Vec<CommentThread>>>, bool) {
        let (job_tx, job_rx) = unbounded::<&MediaItem>();
        for item in media {
            let _ = job_tx.send(item);
        }
        drop(job_tx);

        let (tx, rx) = unbounded::<(String, ApiResult<Vec<Comment>>)>();
        let service = &self.service;
        let workers = self.options.workers.min(media.len());
        thread::scope(|scope| {
            for _ in 0..workers {
                let jobs = job_rx.clone();
                let tx = tx.clone();
                scope.spawn(move || {
                    for item in jobs.iter() {
                        let result = service.load_comments(&item.id);
                        let _ = tx.send((item.id.clone(), result));
                    }
                });
            }
        });
        drop(tx);

        let mut unauthorized = false;
        let mut merged = HashMap::with_capacity(media.len());
        for (media_id, result) in rx {
            let comments = match result {
                Ok(comments) => comments,
                Err(err) => {
                    unauthorized |= err.is_unauthorized();
                    tracing::debug!(%media_id, error = %err, "comments unavailable; showing none");
                    Vec::new()
                }
            };
            let threads: Vec<CommentThread> =
                comments.into_iter().map(CommentThread::new).collect();
            merged.insert(media_id, Arc::new(threads));
        }
        (merged, unauthorized)
    }
}
