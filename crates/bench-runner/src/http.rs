use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{
    is_unavailable_http_status, truncate_error_body, ActionAck, CodeGateway, ExecutionOutput,
    GuiPrimitive, ObservationService, ProtocolError, Screenshot, GATEWAY_EXECUTE_PATH,
    GATEWAY_HEALTH_PATH, GATEWAY_RESTART_PATH, OBSERVATION_ACTION_PATH, OBSERVATION_HEALTH_PATH,
    OBSERVATION_SCREENSHOT_PATH,
};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct ActionRequest<'a> {
    actions: &'a [GuiPrimitive],
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ScreenshotPayload {
    image_base64: String,
    #[serde(default = "default_screenshot_mime")]
    mime_type: String,
}

fn default_screenshot_mime() -> String {
    "image/png".to_string()
}

/// Shared JSON-over-HTTP plumbing for both sandbox services.
#[derive(Clone)]
struct JsonEndpoint {
    service: &'static str,
    base_url: String,
    client: HttpClient,
}

impl JsonEndpoint {
    fn new(service: &'static str, base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().to_string();
        if base_url.is_empty() {
            return Err(anyhow!("{} endpoint must not be empty", service));
        }
        let client = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            service,
            base_url,
            client,
        })
    }

    fn url_for_path(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn send(
        &self,
        method: &str,
        url: &str,
        builder: RequestBuilder,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let response = builder.timeout(timeout).send().map_err(|err| {
            let detail = format!(
                "{} http {} {} transport error: {}",
                self.service, method, url, err
            );
            if err.is_timeout() {
                ProtocolError::timeout(detail)
            } else {
                ProtocolError::unreachable(detail)
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        let body = response
            .text()
            .map(|value| truncate_error_body(&value))
            .unwrap_or_else(|_| "<response body unavailable>".to_string());
        let detail = format!(
            "{} http {} {} failed: status={} body={}",
            self.service, method, url, code, body
        );
        if code == 408 {
            Err(ProtocolError::timeout(detail))
        } else if is_unavailable_http_status(code) {
            Err(ProtocolError::unreachable(detail))
        } else {
            Err(ProtocolError::rejected(detail))
        }
    }

    fn decode<Resp: DeserializeOwned>(
        &self,
        method: &str,
        url: &str,
        response: Response,
    ) -> Result<Resp, ProtocolError> {
        response.json::<Resp>().map_err(|err| {
            let detail = format!(
                "{} http {} {} returned invalid JSON payload: {}",
                self.service, method, url, err
            );
            if err.is_timeout() {
                ProtocolError::timeout(detail)
            } else {
                ProtocolError::rejected(detail)
            }
        })
    }

    fn get_json<Resp: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<Resp, ProtocolError> {
        let url = self.url_for_path(path);
        let response = self.send("GET", &url, self.client.get(&url), timeout)?;
        self.decode("GET", &url, response)
    }

    fn post_json<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, ProtocolError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.url_for_path(path);
        let response = self.send("POST", &url, self.client.post(&url).json(request), timeout)?;
        self.decode("POST", &url, response)
    }

    fn expect_ok_status(&self, path: &str, response: StatusResponse) -> Result<(), ProtocolError> {
        if response.status == "ok" {
            Ok(())
        } else {
            Err(ProtocolError::rejected(format!(
                "{} {} reported status '{}'",
                self.service, path, response.status
            )))
        }
    }
}

#[derive(Clone)]
pub struct HttpCodeGateway {
    endpoint: JsonEndpoint,
}

impl HttpCodeGateway {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new("gateway", base_url, connect_timeout)?,
        })
    }
}

impl CodeGateway for HttpCodeGateway {
    fn health(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let response: StatusResponse = self.endpoint.get_json(GATEWAY_HEALTH_PATH, timeout)?;
        self.endpoint.expect_ok_status(GATEWAY_HEALTH_PATH, response)
    }

    fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionOutput, ProtocolError> {
        let request = ExecuteRequest {
            code,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.endpoint
            .post_json(GATEWAY_EXECUTE_PATH, &request, timeout)
    }

    fn restart(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let response: StatusResponse =
            self.endpoint
                .post_json(GATEWAY_RESTART_PATH, &serde_json::json!({}), timeout)?;
        self.endpoint.expect_ok_status(GATEWAY_RESTART_PATH, response)
    }
}

#[derive(Clone)]
pub struct HttpObservationService {
    endpoint: JsonEndpoint,
}

impl HttpObservationService {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new("observation", base_url, connect_timeout)?,
        })
    }
}

impl ObservationService for HttpObservationService {
    fn health(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let response: StatusResponse = self
            .endpoint
            .get_json(OBSERVATION_HEALTH_PATH, timeout)?;
        self.endpoint
            .expect_ok_status(OBSERVATION_HEALTH_PATH, response)
    }

    fn screenshot(&self, pointer: bool, timeout: Duration) -> Result<Screenshot, ProtocolError> {
        let url = format!(
            "{}?pointer={}",
            self.endpoint.url_for_path(OBSERVATION_SCREENSHOT_PATH),
            pointer
        );
        let response = self
            .endpoint
            .send("GET", &url, self.endpoint.client.get(&url), timeout)?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type.starts_with("image/") {
            let bytes = response.bytes().map_err(|err| {
                ProtocolError::rejected(format!("observation screenshot body unreadable: {}", err))
            })?;
            return Ok(Screenshot {
                bytes: bytes.to_vec(),
                mime_type: content_type,
            });
        }
        let payload: ScreenshotPayload = self.endpoint.decode("GET", &url, response)?;
        let bytes = BASE64_STANDARD
            .decode(payload.image_base64.as_bytes())
            .map_err(|err| {
                ProtocolError::rejected(format!("observation screenshot is not base64: {}", err))
            })?;
        Ok(Screenshot {
            bytes,
            mime_type: payload.mime_type,
        })
    }

    fn perform(
        &self,
        actions: &[GuiPrimitive],
        timeout: Duration,
    ) -> Result<ActionAck, ProtocolError> {
        self.endpoint.post_json(
            OBSERVATION_ACTION_PATH,
            &ActionRequest { actions },
            timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serves `responses` in order, forwarding each request body to the test.
    fn spawn_server(
        responses: Vec<(u16, &'static str, String)>,
    ) -> (String, mpsc::Receiver<(String, String)>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tiny_http::Server::from_listener(listener, None).expect("server");
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            for (status, content_type, body) in responses {
                let mut request = match server.recv() {
                    Ok(request) => request,
                    Err(_) => return,
                };
                let mut raw = String::new();
                let _ = request.as_reader().read_to_string(&mut raw);
                let _ = tx.send((request.url().to_string(), raw));
                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    content_type.as_bytes(),
                )
                .expect("header");
                let response = tiny_http::Response::from_data(body.into_bytes())
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });
        (format!("http://{}", addr), rx, handle)
    }

    #[test]
    fn gateway_execute_posts_code_and_timeout() {
        let (url, rx, handle) = spawn_server(vec![(
            200,
            "application/json",
            json!({"stdout": "2\n", "stderr": "", "result": 2, "error": null}).to_string(),
        )]);
        let gateway = HttpCodeGateway::new(&url, Duration::from_secs(2)).expect("client");
        let output = gateway
            .execute("print(1 + 1)", Duration::from_secs(3))
            .expect("execute");
        assert_eq!(output.stdout, "2\n");
        assert_eq!(output.result, Some(json!(2)));
        assert!(!output.is_error());

        let (path, body) = rx.recv().expect("request");
        assert_eq!(path, "/execute");
        let body: Value = serde_json::from_str(&body).expect("json body");
        assert_eq!(body["code"], "print(1 + 1)");
        assert_eq!(body["timeout_ms"], 3000);
        handle.join().expect("server thread");
    }

    #[test]
    fn unavailable_status_is_classified_unreachable() {
        let (url, _rx, handle) = spawn_server(vec![
            (503, "text/plain", "kernel booting".to_string()),
            (400, "text/plain", "bad code".to_string()),
        ]);
        let gateway = HttpCodeGateway::new(&url, Duration::from_secs(2)).expect("client");
        let err = gateway
            .health(Duration::from_secs(2))
            .expect_err("503 should fail");
        assert!(err.is_unreachable(), "unexpected error: {}", err);
        let err = gateway
            .execute("x", Duration::from_secs(2))
            .expect_err("400 should fail");
        assert_eq!(err.kind(), crate::protocol::ProtocolErrorKind::Rejected);
        assert!(err.to_string().contains("bad code"));
        handle.join().expect("server thread");
    }

    #[test]
    fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let gateway =
            HttpCodeGateway::new(&format!("http://{}", addr), Duration::from_millis(500))
                .expect("client");
        let err = gateway
            .health(Duration::from_millis(500))
            .expect_err("nothing listening");
        assert!(err.is_unreachable(), "unexpected error: {}", err);
    }

    #[test]
    fn screenshot_accepts_raw_image_and_json_payloads() {
        let (url, rx, handle) = spawn_server(vec![
            (200, "image/png", "PNGDATA".to_string()),
            (
                200,
                "application/json",
                json!({"image_base64": BASE64_STANDARD.encode(b"JPEGDATA"), "mime_type": "image/jpeg"})
                    .to_string(),
            ),
        ]);
        let service = HttpObservationService::new(&url, Duration::from_secs(2)).expect("client");
        let raw = service
            .screenshot(true, Duration::from_secs(2))
            .expect("raw screenshot");
        assert_eq!(raw.bytes, b"PNGDATA");
        assert_eq!(raw.mime_type, "image/png");
        let (path, _) = rx.recv().expect("request");
        assert_eq!(path, "/screenshot?pointer=true");

        let decoded = service
            .screenshot(false, Duration::from_secs(2))
            .expect("json screenshot");
        assert_eq!(decoded.bytes, b"JPEGDATA");
        assert_eq!(decoded.mime_type, "image/jpeg");
        handle.join().expect("server thread");
    }

    #[test]
    fn perform_reports_action_ack() {
        let (url, rx, handle) = spawn_server(vec![(
            200,
            "application/json",
            json!({"status": "error", "detail": "coordinates off screen"}).to_string(),
        )]);
        let service = HttpObservationService::new(&url, Duration::from_secs(2)).expect("client");
        let ack = service
            .perform(
                &[GuiPrimitive::Move { x: 9000, y: 1 }],
                Duration::from_secs(2),
            )
            .expect("perform");
        assert!(!ack.is_ok());
        assert_eq!(ack.detail.as_deref(), Some("coordinates off screen"));
        let (_, body) = rx.recv().expect("request");
        let body: Value = serde_json::from_str(&body).expect("json body");
        assert_eq!(body["actions"][0]["kind"], "move");
        handle.join().expect("server thread");
    }
}
