use std::io::Read;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tiny_http::{Header, Response, Server};
use url::Url;

use instafeed::auth::{MemoryLocation, Navigator};
use instafeed::data::InstagramFeedService;
use instafeed::feed::{Phase, Synchronizer};
use instafeed::instagram::{self, ApiError, ErrorKind, MediaType, TokenProvider};
use instafeed::session;
use instafeed::storage;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

type Route = dyn Fn(&Recorded) -> (u16, String) + Send + Sync;

struct MockApi {
    base_url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockApi {
    fn start(route: Arc<Route>) -> Self {
        let server = Server::http("127.0.0.1:0").expect("bind mock api");
        let base_url = format!("http://{}/api/instagram", server.server_addr());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let recorded = Recorded {
                    method: request.method().to_string(),
                    path: request
                        .url()
                        .trim_start_matches("/api/instagram")
                        .to_string(),
                    authorization: request
                        .headers()
                        .iter()
                        .find(|header| header.field.equiv("Authorization"))
                        .map(|header| header.value.as_str().to_string()),
                    body,
                };
                let (status, payload) = route(&recorded);
                seen.lock().push(recorded);
                let content_type =
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("content type header");
                let _ = request.respond(
                    Response::from_string(payload)
                        .with_status_code(status)
                        .with_header(content_type),
                );
            }
        });

        Self { base_url, requests }
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    fn count(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }
}

fn instagram_routes(profile_status: u16) -> Arc<Route> {
    Arc::new(move |request: &Recorded| {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/profile") if profile_status != 200 => {
                (profile_status, r#"{"error":"nope"}"#.to_string())
            }
            ("GET", "/profile") => (
                200,
                r#"{"id":"17841","username":"jane","account_type":"BUSINESS","media_count":3,"followers_count":120}"#
                    .to_string(),
            ),
            ("GET", "/media") => (
                200,
                r#"{"data":[
                    {"id":"m1","media_type":"IMAGE","media_url":"https://cdn.test/m1.jpg","caption":"one","timestamp":"2024-03-01T10:00:00+0000"},
                    {"id":"m2","media_type":"VIDEO","media_url":"https://cdn.test/m2.mp4","caption":"two","timestamp":"2024-03-02T10:00:00+0000"},
                    {"id":"m3","media_type":"CAROUSEL_ALBUM","media_url":"https://cdn.test/m3.jpg","caption":"three","timestamp":"2024-03-03T10:00:00+0000"}
                ]}"#
                    .to_string(),
            ),
            ("GET", "/media/m2/comments") => (500, r#"{"error":"broken"}"#.to_string()),
            ("GET", path) if path.starts_with("/media/") && path.ends_with("/comments") => (
                200,
                r#"{"data":[{"id":"c1","text":"first!","username":"sam"},{"id":"c2","text":"nice"}]}"#
                    .to_string(),
            ),
            ("GET", "/comment/c1/replies") => (
                200,
                r#"{"data":[{"id":"r1","text":"thanks sam"}]}"#.to_string(),
            ),
            ("POST", "/media/m1/comments") => (
                200,
                r#"{"id":"c9","text":"lovely"}"#.to_string(),
            ),
            ("POST", "/media/m1/comment/reply") => (
                200,
                r#"{"id":"r9","text":"see you"}"#.to_string(),
            ),
            ("POST", "/logout") => (200, r#"{"success":true}"#.to_string()),
            _ => (404, r#"{"error":"not found"}"#.to_string()),
        }
    })
}

struct Fixed(&'static str);

impl TokenProvider for Fixed {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

struct NoBrowser;

impl Navigator for NoBrowser {
    fn navigate(&self, _url: &Url) -> anyhow::Result<()> {
        Ok(())
    }
}

fn client(api: &MockApi, provider: Arc<dyn TokenProvider>) -> Arc<instagram::Client> {
    Arc::new(
        instagram::Client::new(
            provider,
            instagram::ClientConfig {
                user_agent: "instafeed-tests".into(),
                base_url: Some(api.base_url.clone()),
                ..instagram::ClientConfig::default()
            },
        )
        .expect("client"),
    )
}

fn signed_in_session(api: &MockApi) -> Arc<session::Manager> {
    let store = Arc::new(storage::Store::in_memory().expect("store"));
    let session = Arc::new(session::Manager::new(
        store,
        Arc::new(NoBrowser),
        instagram::login_url(&api.base_url).expect("login url"),
    ));
    let mut location =
        MemoryLocation::parse("http://127.0.0.1:65010/callback?token=abc123").expect("location");
    session.initialize(&mut location);
    assert!(session.is_authenticated());
    session
}

#[test]
fn requests_carry_bearer_token() {
    let api = MockApi::start(instagram_routes(200));
    let client = client(&api, Arc::new(Fixed("abc123")));

    let profile = client.profile().expect("profile");
    assert_eq!(profile.username, "jane");
    assert_eq!(profile.followers_count, Some(120));

    let media = client.media().expect("media");
    assert_eq!(media.len(), 3);
    assert_eq!(media[1].media_type, MediaType::Video);

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    for request in requests {
        assert_eq!(request.authorization.as_deref(), Some("Bearer abc123"));
    }
}

#[test]
fn status_codes_are_classified() {
    let api = MockApi::start(instagram_routes(401));
    let client = client(&api, Arc::new(Fixed("abc123")));
    let err = client.profile().unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = client.comments("m2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upstream);
    match err {
        ApiError::Upstream { status, .. } => assert_eq!(status.as_u16(), 500),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn mutation_bodies_match_the_api_contract() {
    let api = MockApi::start(instagram_routes(200));
    let client = client(&api, Arc::new(Fixed("abc123")));

    let comment = client.create_comment("m1", "lovely").expect("comment");
    assert_eq!(comment.id, "c9");
    let reply = client
        .reply_to_comment("m1", "c1", "see you")
        .expect("reply");
    assert_eq!(reply.id, "r9");
    client.logout().expect("logout");

    let requests = api.requests();
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body, serde_json::json!({ "message": "lovely" }));
    assert_eq!(requests[1].path, "/media/m1/comment/reply");
    let body: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(
        body,
        serde_json::json!({ "commentId": "c1", "message": "see you" })
    );
    assert_eq!(requests[2].method, "POST");
    assert_eq!(requests[2].path, "/logout");
}

#[test]
fn synchronizer_loads_feed_over_http() {
    let api = MockApi::start(instagram_routes(200));
    let session = signed_in_session(&api);
    let service = Arc::new(InstagramFeedService::new(client(&api, session.clone())));
    let sync = Synchronizer::new(service, session);

    sync.load_all().expect("load");
    let view = sync.snapshot();
    assert_eq!(view.phase, Phase::Ready);
    assert_eq!(view.media_items.len(), 3);
    assert_eq!(view.comments("m1").len(), 2);
    assert!(view.comments("m2").is_empty());
    assert_eq!(view.comments("m3").len(), 2);

    sync.expand_replies("m1", "c1").expect("expand");
    sync.expand_replies("m1", "c1").expect("collapse");
    sync.expand_replies("m1", "c1").expect("expand again");
    assert_eq!(api.count("/comment/c1/replies"), 1);
    assert!(sync.snapshot().thread("m1", "c1").unwrap().replies_visible());

    sync.post_comment("m1", "lovely").expect("comment");
    sync.post_reply("m1", "c1", "see you").expect("reply");
    let view = sync.snapshot();
    assert_eq!(view.comments("m1").last().unwrap().id(), "c9");
    let replies = view.thread("m1", "c1").unwrap().replies();
    assert_eq!(replies.last().unwrap().id, "r9");
}

#[test]
fn profile_unauthorized_ends_the_session() {
    let api = MockApi::start(instagram_routes(401));
    let session = signed_in_session(&api);
    let service = Arc::new(InstagramFeedService::new(client(&api, session.clone())));
    let sync = Synchronizer::new(service, session.clone());

    let err = sync.load_all().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(!session.is_authenticated());
    let view = sync.snapshot();
    assert_eq!(view.phase, Phase::Errored);
    assert_eq!(
        view.pending_error.expect("error recorded").kind,
        ErrorKind::Authorization
    );

    let before = api.requests().len();
    assert!(sync.retry().is_err());
    assert_eq!(api.requests().len(), before);
}
