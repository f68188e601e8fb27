#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use jobhunter::config::{
    LlmSettings, NotificationSettings, PathSettings, PdfSettings, ProviderSettings,
    ScoringSettings, ScrapeSettings, Secrets, Settings,
};
use jobhunter::models::KeywordConfig;
use serde_json::{Value, json};

fn respond_json(request: tiny_http::Request, status: u16, body: &Value) {
    let mut response =
        tiny_http::Response::from_string(body.to_string()).with_status_code(status);
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    response = response.with_header(header);
    let _ = request.respond(response);
}

// --- job board stub ---

#[derive(Debug, Default)]
pub struct BoardState {
    pub requests: Vec<String>,
}

pub struct JobBoardStub {
    pub base_url: String,
    pub state: Arc<Mutex<BoardState>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl JobBoardStub {
    /// Serves `/jobs?page=1` with one card per (title, company, location)
    /// triple and empty pages afterwards. `broken` makes every request 500.
    pub fn spawn(jobs: Vec<(String, String, String)>, broken: bool) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start job board stub");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let state = Arc::new(Mutex::new(BoardState::default()));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_state = state.clone();
        let page_base = base_url.clone();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                thread_state.lock().expect("board state").requests.push(url.clone());

                if broken {
                    let _ = request.respond(
                        tiny_http::Response::from_string("boom").with_status_code(500),
                    );
                    continue;
                }

                let body = if url.contains("page=1") {
                    let cards = jobs
                        .iter()
                        .enumerate()
                        .map(|(idx, (title, company, location))| {
                            format!(
                                r#"<div class="job-card"><h2 class="title">{title}</h2>
                                   <span class="company">{company}</span>
                                   <span class="location">{location}</span>
                                   <a class="apply" href="{page_base}/jobs/{idx}">Apply</a></div>"#
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    format!("<html><body>{cards}</body></html>")
                } else {
                    "<html><body></body></html>".to_owned()
                };

                let _ = request.respond(tiny_http::Response::from_string(body));
            }
        });

        Self {
            base_url,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().expect("board state").requests.len()
    }
}

impl Drop for JobBoardStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// --- chat-completions model stub ---

#[derive(Debug, Default)]
pub struct ModelState {
    pub score_calls: usize,
    pub tailor_calls: usize,
    pub verify_calls: usize,
    pub score_prompts: Vec<String>,
}

pub struct ModelStub {
    pub base_url: String,
    pub state: Arc<Mutex<ModelState>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ModelStub {
    /// Scores come from a `fit<NN>` hint in the prompt (default 85). The
    /// verifier fails the first `verify_failures` calls, then passes.
    pub fn spawn(verify_failures: usize) -> Self {
        Self::spawn_with(verify_failures, 0)
    }

    /// `bad_json_scores` makes the first N scoring replies plain prose
    /// instead of JSON, to exercise the strict-JSON retry.
    pub fn spawn_with(verify_failures: usize, bad_json_scores: usize) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start model stub");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let state = Arc::new(Mutex::new(ModelState::default()));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_state = state.clone();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                if request.url() != "/v1/chat/completions" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("bad body").with_status_code(400),
                    );
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(&body) else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("bad json").with_status_code(400),
                    );
                    continue;
                };

                let prompt = parsed["messages"]
                    .as_array()
                    .map(|messages| {
                        messages
                            .iter()
                            .filter_map(|m| m["content"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();

                let content = {
                    let mut state = thread_state.lock().expect("model state");
                    if prompt.contains("BEGIN_TAILORED_HTML") {
                        state.verify_calls += 1;
                        if state.verify_calls <= verify_failures {
                            json!({ "pass": false, "issues": ["fabricated skill: juggling"] })
                                .to_string()
                        } else {
                            json!({ "pass": true, "issues": [] }).to_string()
                        }
                    } else if prompt.contains("Output body HTML only") {
                        state.tailor_calls += 1;
                        "```html\n<h1>Tailored résumé</h1>\n```".to_owned()
                    } else {
                        state.score_calls += 1;
                        state.score_prompts.push(prompt.clone());
                        if state.score_calls <= bad_json_scores {
                            "The score is definitely high, trust me.".to_owned()
                        } else {
                            let score = score_hint(&prompt).unwrap_or(85);
                            json!({ "score": score, "reasoning": "stub reasoning" }).to_string()
                        }
                    }
                };

                let response = json!({
                    "id": "chatcmpl-stub",
                    "object": "chat.completion",
                    "choices": [
                        { "index": 0, "message": { "role": "assistant", "content": content } }
                    ]
                });
                respond_json(request, 200, &response);
            }
        });

        Self {
            base_url,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn score_calls(&self) -> usize {
        self.state.lock().expect("model state").score_calls
    }

    pub fn tailor_calls(&self) -> usize {
        self.state.lock().expect("model state").tailor_calls
    }

    pub fn verify_calls(&self) -> usize {
        self.state.lock().expect("model state").verify_calls
    }
}

impl Drop for ModelStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn score_hint(prompt: &str) -> Option<i64> {
    let mut rest = prompt;
    while let Some(idx) = rest.find("fit") {
        let after = &rest[idx + 3..];
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            return digits.parse().ok();
        }
        rest = after;
    }
    None
}

// --- telegram bot api stub ---

#[derive(Debug, Default)]
pub struct TelegramState {
    pub messages: Vec<Value>,
    pub documents: usize,
    pub answered: Vec<String>,
    pub pending_updates: Vec<Value>,
}

pub struct TelegramStub {
    pub base_url: String,
    pub state: Arc<Mutex<TelegramState>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TelegramStub {
    pub fn spawn(pending_updates: Vec<Value>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start telegram stub");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let state = Arc::new(Mutex::new(TelegramState {
            pending_updates,
            ..TelegramState::default()
        }));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_state = state.clone();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

                let mut state = thread_state.lock().expect("telegram state");
                let reply = if url.ends_with("/sendMessage") {
                    state.messages.push(parsed);
                    json!({ "ok": true, "result": { "message_id": 1 } })
                } else if url.ends_with("/sendDocument") {
                    state.documents += 1;
                    json!({ "ok": true, "result": { "message_id": 2 } })
                } else if url.ends_with("/getUpdates") {
                    let updates = std::mem::take(&mut state.pending_updates);
                    json!({ "ok": true, "result": updates })
                } else if url.ends_with("/answerCallbackQuery") {
                    let id = parsed["callback_query_id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_owned();
                    state.answered.push(id);
                    json!({ "ok": true, "result": true })
                } else {
                    json!({ "ok": false, "description": "unknown method" })
                };
                drop(state);

                respond_json(request, 200, &reply);
            }
        });

        Self {
            base_url,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("telegram state")
            .messages
            .iter()
            .filter_map(|m| m["text"].as_str().map(str::to_owned))
            .collect()
    }

    pub fn document_count(&self) -> usize {
        self.state.lock().expect("telegram state").documents
    }

    pub fn answered_count(&self) -> usize {
        self.state.lock().expect("telegram state").answered.len()
    }
}

impl Drop for TelegramStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// --- settings / fixture helpers ---

pub const MASTER_RESUME_YAML: &str = r#"
personal:
  name: Alex Jansen
  email: alex@example.com
  phone: "+31 6 12345678"
summary:
  default: Cloud engineer with 8 years of platform and infrastructure work.
experience:
  - company: ExampleCorp
    role: Senior Cloud Engineer
    period: 2019-2026
    achievements:
      - Cut infrastructure cost 30% by consolidating clusters
certifications: []
education:
  - school: TU Delft
    degree: BSc Computer Science
skills:
  cloud: [aws, kubernetes, terraform]
  languages: [python, rust]
"#;

/// Builds settings rooted in a temp dir, pointed at the given stubs, with
/// `cp` standing in for the external PDF renderer.
pub fn test_settings(root: &Path, model_base: &str, telegram: Option<&TelegramStub>) -> Settings {
    let config_dir = root.join("config");
    std::fs::create_dir_all(config_dir.join("site_configs")).expect("create config dirs");
    std::fs::write(config_dir.join("master_resume.yaml"), MASTER_RESUME_YAML)
        .expect("write master resume");

    let mut weights = BTreeMap::new();
    weights.insert("skills_match".to_owned(), 50);
    weights.insert("experience_level".to_owned(), 30);
    weights.insert("location".to_owned(), 20);

    Settings {
        scoring: ScoringSettings {
            weights,
            score_threshold: 60,
            max_listing_chars: 8000,
        },
        notifications: NotificationSettings {
            instant_threshold: 80,
            digest_threshold: 60,
            log_threshold: 40,
            telegram_api_base: telegram
                .map(|t| t.base_url.clone())
                .unwrap_or_else(|| "https://api.telegram.org".to_owned()),
            smtp: None,
        },
        llm: LlmSettings {
            timeout_secs: 10,
            json_retries: 1,
            providers: vec![ProviderSettings {
                name: "primary".to_owned(),
                base_url: model_base.to_owned(),
                model: "stub-model".to_owned(),
                api_key_env: None,
                api_key: None,
            }],
        },
        scrape: ScrapeSettings {
            timeout_secs: 5,
            retry_backoff_secs: vec![0, 0],
            max_workers: 5,
        },
        keywords: KeywordConfig::default(),
        paths: PathSettings {
            data_dir: root.join("data"),
            output_dir: root.join("output"),
            log_dir: root.join("logs"),
            site_configs_dir: config_dir.join("site_configs"),
            master_resume: config_dir.join("master_resume.yaml"),
        },
        pdf: PdfSettings {
            renderer_bin: "cp".to_owned(),
        },
        secrets: Secrets {
            telegram_bot_token: telegram.map(|_| "stub-token".to_owned()),
            telegram_chat_id: telegram.map(|_| "42".to_owned()),
            smtp_password: None,
        },
    }
}

pub fn write_site_config(settings: &Settings, site_id: &str, board: &JobBoardStub) -> PathBuf {
    let yaml = format!(
        r#"
site_id: {site_id}
name: {site_id}
url: {base}
country: NL
max_pages: 2
strategy: html
list_url: "{base}/jobs?page={{page}}"
card_selector: ".job-card"
fields:
  title: {{ selector: ".title" }}
  company: {{ selector: ".company" }}
  location: {{ selector: ".location" }}
  url: {{ selector: "a.apply", attribute: href }}
"#,
        base = board.base_url,
    );
    let path = settings.paths.site_configs_dir.join(format!("{site_id}.yaml"));
    std::fs::write(&path, yaml).expect("write site config");
    path
}
