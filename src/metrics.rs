//! Метрики для мониторинга в формате Prometheus (RED: Rate, Errors, Duration).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use anyhow::{Context, Result};
use tracing::{error, info};
use serde::Serialize;

/// Верхние границы корзин гистограммы длительности (в секундах). +Inf даётся отдельно как count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// LDAP operations tracked per op label.
const OPS: [&str; 3] = ["bind", "search", "root_dse"];

/// Гистограмма для одной операции: корзины + счётчик + сумма (в микросекундах).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Инкрементируем только одну корзину: первую, для которой secs <= le (некумулятивное хранение).
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct OpCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

/// Счётчики метрик (thread-safe, lock-free).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Всего принятых клиентских подключений.
    pub connections_total: AtomicU64,
    /// Ошибки парсинга LDAP-сообщений (невалидный BER / не SEQUENCE в начале).
    pub parse_errors: AtomicU64,
    /// Search result entries written to clients.
    pub entries_total: AtomicU64,
    bind: OpCounters,
    search: OpCounters,
    root_dse: OpCounters,
    /// SOAP calls by action (Get, Enumerate, Pull, Renew, Release).
    backend_calls: dashmap::DashMap<String, AtomicU64>,
    /// SOAP faults by action.
    backend_faults: dashmap::DashMap<String, AtomicU64>,
    /// Started listeners: listen address -> ADWS instance.
    listeners: dashmap::DashMap<String, String>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&self, op: &str) -> Option<&OpCounters> {
        match op {
            "bind" => Some(&self.bind),
            "search" => Some(&self.search),
            "root_dse" => Some(&self.root_dse),
            _ => None,
        }
    }

    /// Увеличивает счётчик подключений на 1.
    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(c) = self.op(op) {
            c.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn inc_error(&self, op: &str) {
        if let Some(c) = self.op(op) {
            c.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Учитывает длительность запроса (RED: Duration). Вызывать после успешной или неуспешной обработки.
    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(c) = self.op(op) {
            c.duration.observe(duration);
        }
    }

    /// Увеличивает счётчик ошибок парсинга (ожидался SEQUENCE, пришёл другой тег и т.д.).
    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_entries(&self, n: u64) {
        self.entries_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one SOAP call; `fault` when the backend answered with a fault.
    pub fn inc_backend_call(&self, action: &str, fault: bool) {
        self.backend_calls
            .entry(action.to_string())
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
        if fault {
            self.backend_faults
                .entry(action.to_string())
                .or_insert_with(AtomicU64::default)
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn listener_started(&self, listen_addr: &str, instance: &str) {
        self.listeners.insert(listen_addr.to_string(), instance.to_string());
    }

    /// Рендер метрик в текстовом формате Prometheus (exposition format).
    pub fn render(&self) -> String {
        let mut out = String::new();
        let c = self.connections_total.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_adws_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_adws_connections_total counter\n");
        out.push_str(&format!("ldap_adws_connections_total {}\n", c));

        let pe = self.parse_errors.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_adws_parse_errors_total Total number of LDAP message parse errors (invalid BER / wrong tag).\n");
        out.push_str("# TYPE ldap_adws_parse_errors_total counter\n");
        out.push_str(&format!("ldap_adws_parse_errors_total {}\n", pe));

        out.push_str("# HELP ldap_adws_requests_total Total LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_adws_requests_total counter\n");
        for op in OPS {
            if let Some(c) = self.op(op) {
                out.push_str(&format!("ldap_adws_requests_total{{op=\"{}\"}} {}\n", op, c.requests.load(Ordering::Relaxed)));
            }
        }

        out.push_str("# HELP ldap_adws_errors_total Total errors by operation.\n");
        out.push_str("# TYPE ldap_adws_errors_total counter\n");
        for op in OPS {
            if let Some(c) = self.op(op) {
                out.push_str(&format!("ldap_adws_errors_total{{op=\"{}\"}} {}\n", op, c.errors.load(Ordering::Relaxed)));
            }
        }

        out.push_str("# HELP ldap_adws_entries_total Search result entries returned to clients.\n");
        out.push_str("# TYPE ldap_adws_entries_total counter\n");
        out.push_str(&format!("ldap_adws_entries_total {}\n", self.entries_total.load(Ordering::Relaxed)));

        out.push_str("# HELP ldap_adws_backend_calls_total SOAP calls sent to ADWS by action.\n");
        out.push_str("# TYPE ldap_adws_backend_calls_total counter\n");
        for entry in self.backend_calls.iter() {
            out.push_str(&format!(
                "ldap_adws_backend_calls_total{{action=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_adws_backend_faults_total SOAP faults returned by ADWS by action.\n");
        out.push_str("# TYPE ldap_adws_backend_faults_total counter\n");
        for entry in self.backend_faults.iter() {
            out.push_str(&format!(
                "ldap_adws_backend_faults_total{{action=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        // RED Duration: гистограмма длительности запросов по операциям
        out.push_str("# HELP ldap_adws_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_adws_request_duration_seconds histogram\n");
        for op in OPS {
            let Some(hist) = self.op(op).map(|c| &c.duration) else {
                continue;
            };
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_adws_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_adws_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_adws_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_adws_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }

    fn ready_body(&self) -> ReadyBody {
        let listeners: Vec<ListenerState> = self
            .listeners
            .iter()
            .map(|e| ListenerState {
                listen: e.key().clone(),
                instance: e.value().clone(),
            })
            .collect();
        ReadyBody {
            ready: !listeners.is_empty(),
            listeners,
        }
    }
}

/// Тело ответа GET /ready: запущенные listeners.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    listeners: Vec<ListenerState>,
}

#[derive(Serialize)]
struct ListenerState {
    listen: String,
    instance: String,
}

/// Извлекает путь из первой строки HTTP-запроса (например "GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Запускает HTTP-сервер для эндпоинтов GET /metrics, GET /health, GET /ready.
/// - /health (liveness): 200 если процесс жив.
/// - /ready (readiness): 200 если запущен хотя бы один LDAP listener, иначе 503.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if total >= 4 && buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request
                .lines()
                .next()
                .map(request_path)
                .unwrap_or("");

            let (status, body, content_type) = match path {
                "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
                "/ready" => {
                    let ready = metrics.ready_body();
                    let status = if ready.ready { "200 OK" } else { "503 Service Unavailable" };
                    let body_json = serde_json::to_string(&ready)
                        .unwrap_or_else(|_| r#"{"ready":false,"listeners":[],"error":"serialize"}"#.to_string());
                    (status, body_json, "application/json")
                }
                "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
                _ => ("404 Not Found", "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(), "text/plain; charset=utf-8"),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
