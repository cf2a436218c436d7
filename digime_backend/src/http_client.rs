use std::time::Duration;

/// HTTP client for the model and bridge calls. Every request is bounded by
/// `timeout` so a stalled peer cannot wedge a contact's cycle.
///
/// System proxy discovery is opt-in (`DIGIME_ENABLE_SYSTEM_PROXY=1`); if it
/// fails the client is rebuilt without proxies.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    let allow_system_proxy = std::env::var("DIGIME_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return Ok(client),
            Err(e) => tracing::warn!(
                "HTTP client with system proxy discovery failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    attempt_build(timeout, true)
}

fn attempt_build(timeout: Duration, no_proxy: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout);
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Address of a server that accepts connections and never answers.
    pub(crate) async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn requests_to_a_silent_peer_time_out() {
        let base = silent_server().await;
        let client = build_http_client(Duration::from_millis(200)).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), client.get(&base).send())
            .await
            .expect("client timeout should fire before the guard");

        let error = result.expect_err("silent peer must not produce a response");
        assert!(error.is_timeout());
    }
}
