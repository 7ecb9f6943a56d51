use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ChallengeParams, EventStream, Fetched, GameStream, Platform};
use crate::error::{BotError, Result};
use crate::model::{GameSummary, UserProfile};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_FOR: Duration = Duration::from_secs(60);
const MAX_CHAT_LEN: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Profile,
    Playing,
    Stream,
    StreamEvent,
    Move,
    Takeback,
    Draw,
    Chat,
    Abort,
    Resign,
    Accept,
    Decline,
    Challenge,
    Cancel,
    Upgrade,
    Export,
    OnlineBots,
    Status,
    PublicData,
    TokenTest,
}

impl Endpoint {
    /// Path template; each `{}` is filled in order.
    pub fn template(self) -> &'static str {
        match self {
            Endpoint::Profile => "api/account",
            Endpoint::Playing => "api/account/playing",
            Endpoint::Stream => "api/bot/game/stream/{}",
            Endpoint::StreamEvent => "api/stream/event",
            Endpoint::Move => "api/bot/game/{}/move/{}",
            Endpoint::Takeback => "api/bot/game/{}/takeback/{}",
            Endpoint::Draw => "api/bot/game/{}/draw/yes",
            Endpoint::Chat => "api/bot/game/{}/chat",
            Endpoint::Abort => "api/bot/game/{}/abort",
            Endpoint::Resign => "api/bot/game/{}/resign",
            Endpoint::Accept => "api/challenge/{}/accept",
            Endpoint::Decline => "api/challenge/{}/decline",
            Endpoint::Challenge => "api/challenge/{}",
            Endpoint::Cancel => "api/challenge/{}/cancel",
            Endpoint::Upgrade => "api/bot/account/upgrade",
            Endpoint::Export => "game/export/{}",
            Endpoint::OnlineBots => "api/bot/online",
            Endpoint::Status => "api/users/status",
            Endpoint::PublicData => "api/user/{}",
            Endpoint::TokenTest => "api/token/test",
        }
    }

    pub fn path(self, args: &[&str]) -> String {
        let mut out = String::new();
        let mut args = args.iter();
        for (i, part) in self.template().split("{}").enumerate() {
            if i > 0 {
                out.push_str(args.next().copied().unwrap_or_default());
            }
            out.push_str(part);
        }
        out
    }

    /// How long the endpoint is off limits after an HTTP 429.
    pub fn rate_limit(self) -> Duration {
        match self {
            Endpoint::Move => Duration::from_secs(1),
            _ => Duration::from_secs(60),
        }
    }
}

pub struct LichessClient {
    client: Client,
    /// Unauthenticated client for third-party hosts.
    public: Client,
    base_url: String,
    token: String,
    rate_limited: Mutex<HashMap<Endpoint, Instant>>,
}

impl LichessClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        Self::build(base_url, token, None)
    }

    /// Rebuilds the client with the account name in the user agent.
    pub fn with_username(self, username: &str) -> Result<Self> {
        Self::build(&self.base_url, &self.token, Some(username))
    }

    fn build(base_url: &str, token: &str, username: Option<&str>) -> Result<Self> {
        let user_agent = match username {
            Some(name) => format!("lichess-bot/{VERSION} user:{name}"),
            None => format!("lichess-bot/{VERSION}"),
        };
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| BotError::Config("token contains invalid characters".into()))?;
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .user_agent(user_agent.clone())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let public = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            public,
            base_url,
            token: token.to_string(),
            rate_limited: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, endpoint: Endpoint, args: &[&str]) -> String {
        format!("{}{}", self.base_url, endpoint.path(args))
    }

    fn check_rate_limit(&self, endpoint: Endpoint) -> Result<()> {
        let mut limits = self.rate_limited.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = limits.get(&endpoint).copied() {
            let now = Instant::now();
            if now < until {
                return Err(BotError::RateLimited {
                    endpoint: endpoint.template().to_string(),
                    remaining: until - now,
                });
            }
            limits.remove(&endpoint);
        }
        Ok(())
    }

    fn mark_rate_limited(&self, endpoint: Endpoint) {
        warn!(endpoint = endpoint.template(), "Rate limited, backing off");
        let mut limits = self.rate_limited.lock().unwrap_or_else(|e| e.into_inner());
        limits.insert(endpoint, Instant::now() + endpoint.rate_limit());
    }

    /// Sends a request, retrying server errors and connection failures for up to
    /// a minute. Client errors are returned at once.
    async fn send<F>(&self, endpoint: Endpoint, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        self.check_rate_limit(endpoint)?;
        let started = Instant::now();
        loop {
            let err = match build().send().await {
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    self.mark_rate_limited(endpoint);
                    return Err(BotError::RateLimited {
                        endpoint: endpoint.template().to_string(),
                        remaining: endpoint.rate_limit(),
                    });
                }
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    let err = BotError::Http {
                        status,
                        endpoint: endpoint.template().to_string(),
                        body,
                    };
                    if status < 500 {
                        return Err(err);
                    }
                    err
                }
                Err(e) if e.is_connect() || e.is_timeout() => BotError::Network(e),
                Err(e) => return Err(e.into()),
            };
            if started.elapsed() >= RETRY_FOR {
                return Err(err);
            }
            debug!(endpoint = endpoint.template(), error = %err, "Retrying request");
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: Endpoint, args: &[&str]) -> Result<T> {
        let url = self.url(endpoint, args);
        let resp = self
            .send(endpoint, || self.client.get(&url).timeout(REQUEST_TIMEOUT))
            .await?;
        Ok(resp.json().await?)
    }

    async fn post(&self, endpoint: Endpoint, args: &[&str], form: &[(&str, String)]) -> Result<Response> {
        let url = self.url(endpoint, args);
        self.send(endpoint, || {
            let req = self.client.post(&url).timeout(REQUEST_TIMEOUT);
            if form.is_empty() {
                req
            } else {
                req.form(form)
            }
        })
        .await
    }

    async fn open_stream(&self, endpoint: Endpoint, args: &[&str]) -> Result<Response> {
        let url = self.url(endpoint, args);
        self.send(endpoint, || self.client.get(&url)).await
    }
}

/// Pops the next complete line off the buffer.
pub(crate) fn next_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

/// Parses one ndjson line. Blank lines are keep-alives (`Some(None)`); lines that
/// fail to parse are logged and skipped (`None`).
pub(crate) fn parse_line<T: DeserializeOwned>(line: &str) -> Option<Option<T>> {
    if line.is_empty() {
        return Some(None);
    }
    match serde_json::from_str(line) {
        Ok(item) => Some(Some(item)),
        Err(e) => {
            warn!(error = %e, line, "Failed to parse stream line");
            None
        }
    }
}

fn ndjson<T, S, B>(bytes: S) -> futures::stream::BoxStream<'static, Result<Option<T>>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (Box::pin(bytes), Vec::new(), false);
    futures::stream::unfold(state, |(mut bytes, mut buf, done)| async move {
        if done {
            return None;
        }
        loop {
            while let Some(line) = next_line(&mut buf) {
                if let Some(item) = parse_line(&line) {
                    return Some((Ok(item), (bytes, buf, false)));
                }
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Some((Err(e.into()), (bytes, buf, true))),
                None => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Platform for LichessClient {
    async fn stream_events(&self) -> Result<EventStream> {
        let resp = self.open_stream(Endpoint::StreamEvent, &[]).await?;
        Ok(ndjson(resp.bytes_stream()))
    }

    async fn stream_game(&self, game_id: &str) -> Result<GameStream> {
        let resp = self.open_stream(Endpoint::Stream, &[game_id]).await?;
        Ok(ndjson(resp.bytes_stream()))
    }

    async fn make_move(&self, game_id: &str, uci: &str, offering_draw: bool) -> Result<()> {
        let url = self.url(Endpoint::Move, &[game_id, uci]);
        let draw = offering_draw.to_string();
        self.send(Endpoint::Move, || {
            self.client
                .post(&url)
                .query(&[("offeringDraw", draw.as_str())])
                .timeout(REQUEST_TIMEOUT)
        })
        .await?;
        Ok(())
    }

    async fn accept_challenge(&self, challenge_id: &str) -> Result<()> {
        self.post(Endpoint::Accept, &[challenge_id], &[]).await?;
        Ok(())
    }

    async fn decline_challenge(&self, challenge_id: &str, reason: &str) -> Result<()> {
        self.post(Endpoint::Decline, &[challenge_id], &[("reason", reason.to_string())])
            .await?;
        Ok(())
    }

    async fn create_challenge(&self, username: &str, params: &ChallengeParams) -> Result<Option<String>> {
        let resp = self.post(Endpoint::Challenge, &[username], &params.form()).await?;
        let body: Value = resp.json().await?;
        Ok(body
            .get("id")
            .or_else(|| body.get("challenge").and_then(|c| c.get("id")))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn cancel_challenge(&self, challenge_id: &str) -> Result<()> {
        self.post(Endpoint::Cancel, &[challenge_id], &[]).await?;
        Ok(())
    }

    async fn resign(&self, game_id: &str) -> Result<()> {
        self.post(Endpoint::Resign, &[game_id], &[]).await?;
        Ok(())
    }

    async fn offer_draw(&self, game_id: &str) -> Result<()> {
        self.post(Endpoint::Draw, &[game_id], &[]).await?;
        Ok(())
    }

    async fn abort(&self, game_id: &str) -> Result<()> {
        self.post(Endpoint::Abort, &[game_id], &[]).await?;
        Ok(())
    }

    async fn answer_takeback(&self, game_id: &str, accept: bool) -> Result<()> {
        let answer = if accept { "yes" } else { "no" };
        self.post(Endpoint::Takeback, &[game_id, answer], &[]).await?;
        Ok(())
    }

    async fn chat(&self, game_id: &str, room: &str, text: &str) -> Result<()> {
        if text.chars().count() > MAX_CHAT_LEN {
            warn!(game_id, len = text.chars().count(), "Chat message too long, not sent");
            return Ok(());
        }
        self.post(
            Endpoint::Chat,
            &[game_id],
            &[("room", room.to_string()), ("text", text.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn profile(&self) -> Result<UserProfile> {
        self.get_json(Endpoint::Profile, &[]).await
    }

    async fn ongoing_games(&self) -> Result<Vec<GameSummary>> {
        let body: Value = self.get_json(Endpoint::Playing, &[]).await?;
        let games = body.get("nowPlaying").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(games)?)
    }

    async fn online_bots(&self) -> Result<Vec<UserProfile>> {
        let url = self.url(Endpoint::OnlineBots, &[]);
        let resp = self
            .send(Endpoint::OnlineBots, || self.client.get(&url).timeout(REQUEST_TIMEOUT))
            .await?;
        let text = resp.text().await?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter_map(|line| parse_line::<UserProfile>(line).flatten())
            .collect())
    }

    async fn public_data(&self, username: &str) -> Result<UserProfile> {
        self.get_json(Endpoint::PublicData, &[username]).await
    }

    async fn is_online(&self, username: &str) -> Result<bool> {
        let url = self.url(Endpoint::Status, &[]);
        let resp = self
            .send(Endpoint::Status, || {
                self.client
                    .get(&url)
                    .query(&[("ids", username)])
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;
        let users: Vec<Value> = resp.json().await?;
        Ok(users
            .first()
            .and_then(|u| u.get("online"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn game_pgn(&self, game_id: &str) -> Result<String> {
        let url = self.url(Endpoint::Export, &[game_id]);
        let resp = self
            .send(Endpoint::Export, || {
                self.client
                    .get(&url)
                    .header("Accept", "application/x-chess-pgn")
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;
        Ok(resp.text().await?)
    }

    async fn upgrade_to_bot(&self) -> Result<()> {
        self.post(Endpoint::Upgrade, &[], &[]).await?;
        Ok(())
    }

    async fn token_scopes(&self) -> Result<Vec<String>> {
        let url = self.url(Endpoint::TokenTest, &[]);
        let resp = self
            .send(Endpoint::TokenTest, || {
                self.client
                    .post(&url)
                    .body(self.token.clone())
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;
        let body: Value = resp.json().await?;
        Ok(body
            .get(&self.token)
            .and_then(|t| t.get("scopes"))
            .and_then(Value::as_str)
            .map(|s| s.split(',').map(|scope| scope.trim().to_string()).collect())
            .unwrap_or_default())
    }

    async fn online_json(&self, url: &str, params: &[(&str, String)], timeout: Duration) -> Result<Value> {
        // The player explorer needs our token; everything else is third party.
        let client = if url.starts_with("https://explorer.lichess.ovh/player") {
            &self.client
        } else {
            &self.public
        };
        let resp = client.get(url).query(params).timeout(timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BotError::Http {
                status: status.as_u16(),
                endpoint: url.to_string(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        // The player explorer streams ndjson snapshots; the last one is complete.
        let text = resp.text().await?;
        let last = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("null");
        Ok(serde_json::from_str(last)?)
    }

    async fn fetch_text(&self, url: &str, etag: Option<&str>) -> Result<Fetched> {
        let mut req = self.public.get(url).timeout(REQUEST_TIMEOUT);
        if let Some(etag) = etag {
            req = req.header(IF_NONE_MATCH, etag);
        }
        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        let resp = resp.error_for_status()?;
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Fetched::Body {
            text: resp.text().await?,
            etag,
        })
    }
}
