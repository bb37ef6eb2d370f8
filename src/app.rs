use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::auth::{self, CallbackListener, MemoryLocation};
use crate::config;
use crate::data::InstagramFeedService;
use crate::feed::{self, SyncError, Synchronizer, ViewState};
use crate::instagram::{self, ErrorKind};
use crate::logging;
use crate::session;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Eq, clap::Subcommand)]
pub enum Command {
    /// Sign in through the browser.
    Login,
    /// Sign out and forget the stored token.
    Logout,
    /// Show whether a session is stored.
    Status,
    /// Print profile, media and comments.
    Feed,
    /// Print the replies under a comment.
    Replies { media_id: String, comment_id: String },
    /// Comment on a media item.
    Comment { media_id: String, text: String },
    /// Reply to a comment.
    Reply {
        media_id: String,
        comment_id: String,
        text: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config_file: Option<PathBuf>,
    pub debug: bool,
    pub command: Option<Command>,
}

struct Runtime {
    cfg: config::Config,
    session: Arc<session::Manager>,
    client: Arc<instagram::Client>,
    sync: Synchronizer,
}

pub fn run(options: Options) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    logging::init(options.debug, Some(&cfg.log.level));

    let store = Arc::new(
        storage::Store::open(storage::Options {
            path: cfg.storage.path.clone(),
        })
        .context("open storage")?,
    );

    let login_url = instagram::login_url(&cfg.api.base_url).context("build login url")?;
    let session = Arc::new(session::Manager::new(
        store,
        Arc::new(auth::SystemBrowser),
        login_url,
    ));
    let mut location = MemoryLocation::parse(&cfg.auth.redirect_uri)?;
    session.initialize(&mut location);

    let client = Arc::new(
        instagram::Client::new(
            session.clone(),
            instagram::ClientConfig {
                user_agent: cfg.api.user_agent.clone(),
                base_url: Some(cfg.api.base_url.clone()),
                timeout: Some(cfg.api.timeout),
                http_client: None,
            },
        )
        .context("build instagram client")?,
    );
    let service = Arc::new(InstagramFeedService::new(client.clone()));
    let sync = Synchronizer::with_options(
        service,
        session.clone(),
        feed::Options {
            workers: cfg.feed.workers,
        },
    );

    let ctx = Runtime {
        cfg,
        session,
        client,
        sync,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match options.command.unwrap_or(Command::Feed) {
        Command::Login => login(&ctx, &mut out),
        Command::Logout => logout(&ctx, &mut out),
        Command::Status => status(&ctx, &mut out),
        Command::Feed => {
            load(&ctx)?;
            render_feed(&ctx.sync.snapshot(), &mut out)?;
            Ok(())
        }
        Command::Replies {
            media_id,
            comment_id,
        } => {
            load(&ctx)?;
            ctx.sync
                .expand_replies(&media_id, &comment_id)
                .map_err(explain)
                .context("load replies")?;
            let view = ctx.sync.snapshot();
            match view.thread(&media_id, &comment_id) {
                Some(thread) => render_thread(thread, &mut out)?,
                None => bail!("comment {comment_id} not found"),
            }
            Ok(())
        }
        Command::Comment { media_id, text } => {
            load(&ctx)?;
            match ctx
                .sync
                .post_comment(&media_id, &text)
                .map_err(explain)
                .context("failed to post comment")?
            {
                Some(comment) => writeln!(out, "Posted comment {}", comment.id)?,
                None => writeln!(out, "Nothing to post.")?,
            }
            Ok(())
        }
        Command::Reply {
            media_id,
            comment_id,
            text,
        } => {
            load(&ctx)?;
            ctx.sync.begin_reply(&media_id, &comment_id);
            ctx.sync.update_reply_text(&text);
            match ctx
                .sync
                .submit_reply()
                .map_err(explain)
                .context("failed to post reply")?
            {
                Some(reply) => writeln!(out, "Posted reply {}", reply.id)?,
                None => writeln!(out, "Nothing to post.")?,
            }
            Ok(())
        }
    }
}

fn login(ctx: &Runtime, out: &mut impl Write) -> Result<()> {
    let listener = CallbackListener::bind(&ctx.cfg.auth.redirect_uri)?;
    writeln!(
        out,
        "Opening {} in your browser.\nWaiting for the login to finish...",
        ctx.session.login_url()
    )?;
    out.flush()?;
    ctx.session.login();

    let landed = listener.wait(ctx.cfg.auth.callback_timeout)?;
    let mut location = MemoryLocation::new(landed);
    ctx.session.initialize(&mut location);

    if let Some(error) = ctx.session.callback_error() {
        bail!("login failed: {error}");
    }
    if !ctx.session.is_authenticated() {
        bail!("login finished without a token");
    }

    match ctx.client.profile() {
        Ok(profile) => writeln!(out, "Signed in as @{}.", profile.username)?,
        Err(err) => {
            tracing::warn!(error = %err, "profile lookup after login failed");
            writeln!(out, "Signed in.")?;
        }
    }
    Ok(())
}

fn logout(ctx: &Runtime, out: &mut impl Write) -> Result<()> {
    if ctx.session.is_authenticated() {
        if let Err(err) = ctx.client.logout() {
            tracing::warn!(error = %err, "remote logout failed; clearing local session anyway");
        }
    }
    ctx.session.logout();
    ctx.sync.reset();
    writeln!(out, "Signed out.")?;
    Ok(())
}

fn status(ctx: &Runtime, out: &mut impl Write) -> Result<()> {
    let config_path = config::default_path();
    writeln!(out, "Config: {}", friendly_path(config_path.as_ref()))?;
    writeln!(out, "API:    {}", ctx.cfg.api.base_url)?;
    if ctx.session.is_authenticated() {
        writeln!(out, "Signed in.")?;
    } else {
        writeln!(out, "Not signed in. Run `instafeed login`.")?;
    }
    Ok(())
}

fn load(ctx: &Runtime) -> Result<()> {
    ctx.sync
        .load_all()
        .map_err(explain)
        .context("load feed")
}

fn explain(err: SyncError) -> anyhow::Error {
    match err.kind() {
        ErrorKind::Authorization => {
            anyhow::Error::new(err).context("not signed in; run `instafeed login`")
        }
        _ => anyhow::Error::new(err),
    }
}

pub fn render_feed(view: &ViewState, out: &mut impl Write) -> io::Result<()> {
    if let Some(profile) = view.profile.as_ref() {
        writeln!(out, "@{} ({})", profile.username, profile.account_type)?;
        let mut stats = vec![format!("{} posts", profile.media_count)];
        if let Some(followers) = profile.followers_count {
            stats.push(format!("{followers} followers"));
        }
        writeln!(out, "{}", stats.join(" | "))?;
        if let Some(bio) = profile.biography.as_deref().filter(|bio| !bio.is_empty()) {
            writeln!(out, "{bio}")?;
        }
        writeln!(out)?;
    }

    for item in view.media_items.iter() {
        let date = item
            .timestamp
            .map(|ts| ts.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        writeln!(out, "[{}] {} {}", item.media_type.as_str(), item.id, date)?;
        if !item.caption.is_empty() {
            writeln!(out, "  {}", item.caption)?;
        }
        writeln!(out, "  {}", item.media_url)?;
        for thread in view.comments(&item.id) {
            render_thread(thread, out)?;
        }
        writeln!(out)?;
    }

    if let Some(error) = view.pending_error.as_ref() {
        writeln!(out, "! {}", error.message)?;
    }
    Ok(())
}

fn render_thread(thread: &feed::CommentThread, out: &mut impl Write) -> io::Result<()> {
    let author = thread.comment.username.as_deref().unwrap_or("someone");
    writeln!(
        out,
        "    {} {}: {}",
        thread.id(),
        author,
        thread.comment.text
    )?;
    if thread.replies_visible() {
        for reply in thread.replies() {
            let author = reply.username.as_deref().unwrap_or("someone");
            writeln!(out, "      ↳ {}: {}", author, reply.text)?;
        }
    }
    Ok(())
}

fn friendly_path(path: Option<&PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/instafeed/config.yaml".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instagram::{Comment, MediaItem, MediaType, Profile};

    #[test]
    fn renders_profile_media_and_comments() {
        let mut view = ViewState {
            profile: Some(Arc::new(Profile {
                id: None,
                username: "jane".into(),
                name: None,
                account_type: "BUSINESS".into(),
                media_count: 1,
                followers_count: Some(42),
                follows_count: None,
                biography: None,
                profile_picture_url: None,
            })),
            media_items: Arc::new(vec![MediaItem {
                id: "m1".into(),
                media_type: MediaType::Video,
                media_url: "https://cdn.test/m1.mp4".into(),
                caption: "at the beach".into(),
                timestamp: None,
                permalink: None,
                thumbnail_url: None,
            }]),
            ..ViewState::default()
        };
        view.comments_by_media_id.insert(
            "m1".into(),
            Arc::new(vec![feed::CommentThread::new(Comment {
                id: "c1".into(),
                text: "wow".into(),
                username: Some("sam".into()),
                timestamp: None,
            })]),
        );

        let mut out = Vec::new();
        render_feed(&view, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("@jane (BUSINESS)"));
        assert!(text.contains("1 posts | 42 followers"));
        assert!(text.contains("[VIDEO] m1"));
        assert!(text.contains("c1 sam: wow"));
    }

    #[test]
    fn friendly_path_falls_back() {
        assert_eq!(friendly_path(None), "~/.config/instafeed/config.yaml");
    }
}
