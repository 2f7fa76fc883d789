//! End-to-end tests over a real WebSocket.
//!
//! A `tokio-tungstenite` client plays the browser page.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use weblink::{Bridge, Connection, ConnectionId, Invocation, SecureCookie, WsServer};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const COOKIE_SECRET: &str = "test-cookie-secret";

// ============================================================================
// Helpers
// ============================================================================

fn any_port() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

async fn start(bridge: &Bridge) -> Result<WsServer> {
    Ok(WsServer::bind_to(bridge, any_port()).await?)
}

async fn connect(server: &WsServer, path: &str) -> Result<Client> {
    connect_with_cookies(server, path, None).await
}

async fn connect_with_cookies(
    server: &WsServer,
    path: &str,
    cookies: Option<&str>,
) -> Result<Client> {
    let mut request = format!("{}{path}", server.ws_url()).into_client_request()?;
    if let Some(cookies) = cookies {
        request.headers_mut().insert(COOKIE, HeaderValue::from_str(cookies)?);
    }
    let (client, _) = connect_async(request).await?;
    Ok(client)
}

/// Cookie header as the login flow would set it for `username`.
fn signed_cookies(username: &str) -> Result<String> {
    let signer = SecureCookie::new(COOKIE_SECRET)?;
    Ok(format!(
        "user_auth_username=\"{}\"; user_auth_method=\"{}\"",
        signer.sign("user_auth_username", username),
        signer.sign("user_auth_method", "ldap"),
    ))
}

/// Sends `greet("Ada")` and returns the script the procedure evaluates.
async fn greet_script(client: &mut Client) -> Result<Value> {
    send_json(
        client,
        json!({ "cmd": "call_py", "py_func_name": "greet", "args": ["Ada"] }),
    )
    .await?;
    let frame = next_json(client).await?;
    Ok(frame["js_code"].clone())
}

/// Reads the next JSON text frame.
async fn next_json(client: &mut Client) -> Result<Value> {
    loop {
        let message = timeout(Duration::from_secs(2), client.next()).await?;
        match message {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => bail!("socket closed"),
        }
    }
}

async fn send_json(client: &mut Client, value: Value) -> Result<()> {
    client.send(Message::text(value.to_string())).await?;
    Ok(())
}

async fn wait_for(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn greet(connection: Connection, invocation: Invocation) -> weblink::Result<()> {
    let name: String = invocation.arg(0)?;
    let user = invocation.username().unwrap_or("anonymous").to_string();
    let reply = connection
        .eval_js(format!("greet({}, {})", weblink::js_string(&name), weblink::js_string(&user)))
        .await?;
    connection.set_tag("reply", reply.unwrap_or(Value::Null));
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_socket_opens_session_from_path() -> Result<()> {
    let bridge = Bridge::builder().build()?;
    let server = start(&bridge).await?;

    let _client = connect(&server, "abc/reports/sales.html?x=1").await?;
    let id = ConnectionId::new("abc");
    assert!(wait_for(|| bridge.connection(&id).is_some()).await);

    let connection = bridge.connection(&id).map(|c| c.pathname().to_string());
    assert_eq!(connection.as_deref(), Some("/reports/sales.html"));

    server.shutdown();
    bridge.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_eval_js_round_trip_over_socket() -> Result<()> {
    let bridge = Bridge::builder().build()?;
    let server = start(&bridge).await?;

    let mut client = connect(&server, "c1/page.html").await?;
    let id = ConnectionId::new("c1");
    assert!(wait_for(|| bridge.connection(&id).is_some()).await);
    let Some(connection) = bridge.connection(&id) else {
        bail!("connection not registered");
    };

    let caller = tokio::spawn(async move { connection.eval_js("1 + 1").await });

    let frame = next_json(&mut client).await?;
    assert_eq!(frame["cmd"], "eval_js");
    assert_eq!(frame["js_code"], "1 + 1");
    send_json(
        &mut client,
        json!({ "cmd": "return_py", "caller_id": frame["id"], "retval": 2 }),
    )
    .await?;

    assert_eq!(caller.await??, Some(json!(2)));

    server.shutdown();
    bridge.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_call_py_with_cookie_identity() -> Result<()> {
    let bridge = Bridge::builder()
        .call_timeout(Duration::from_secs(2))
        .cookie_secret(COOKIE_SECRET)
        .procedure("greet", greet)
        .build()?;
    let server = start(&bridge).await?;

    let cookies = signed_cookies("alice")?;
    let mut client = connect_with_cookies(&server, "c2/index.html", Some(&cookies)).await?;
    send_json(
        &mut client,
        json!({ "cmd": "synchronize_time", "event_time_ms": 1_000.0 }),
    )
    .await?;
    send_json(
        &mut client,
        json!({ "cmd": "call_py", "py_func_name": "greet", "args": ["Ada"] }),
    )
    .await?;

    let frame = next_json(&mut client).await?;
    assert_eq!(frame["js_code"], r#"greet("Ada", "alice")"#);
    send_json(
        &mut client,
        json!({ "cmd": "return_py", "caller_id": frame["id"], "retval": "hello" }),
    )
    .await?;

    let id = ConnectionId::new("c2");
    assert!(
        wait_for(|| bridge
            .connection(&id)
            .and_then(|c| c.tag("reply"))
            .is_some())
        .await
    );
    let connection = bridge.connection(&id);
    assert_eq!(connection.as_ref().and_then(|c| c.tag("reply")), Some(json!("hello")));
    assert!(connection.and_then(|c| c.time_offset_ms()).is_some());

    server.shutdown();
    bridge.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_forged_cookies_give_no_identity() -> Result<()> {
    let bridge = Bridge::builder()
        .call_timeout(Duration::from_millis(200))
        .cookie_secret(COOKIE_SECRET)
        .procedure("greet", greet)
        .build()?;
    let server = start(&bridge).await?;

    let plain = "user_auth_username=admin; user_auth_method=ldap";
    let mut client = connect_with_cookies(&server, "f1/index.html", Some(plain)).await?;
    assert_eq!(greet_script(&mut client).await?, r#"greet("Ada", "anonymous")"#);

    let forged = SecureCookie::new("not-the-server-secret")?.sign("user_auth_username", "admin");
    let header = format!("user_auth_username=\"{forged}\"");
    let mut client = connect_with_cookies(&server, "f2/index.html", Some(&header)).await?;
    assert_eq!(greet_script(&mut client).await?, r#"greet("Ada", "anonymous")"#);

    server.shutdown();
    bridge.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_no_cookie_secret_means_no_identity() -> Result<()> {
    let bridge = Bridge::builder()
        .call_timeout(Duration::from_millis(200))
        .procedure("greet", greet)
        .build()?;
    let server = start(&bridge).await?;

    let cookies = signed_cookies("alice")?;
    let mut client = connect_with_cookies(&server, "n1/index.html", Some(&cookies)).await?;
    assert_eq!(greet_script(&mut client).await?, r#"greet("Ada", "anonymous")"#);

    server.shutdown();
    bridge.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_client_close_removes_session() -> Result<()> {
    let bridge = Bridge::builder().build()?;
    let server = start(&bridge).await?;

    let mut first = connect(&server, "one/page.html").await?;
    let _second = connect(&server, "two/page.html").await?;
    assert!(wait_for(|| bridge.connection_count() == 2).await);

    first.close(None).await?;
    assert!(wait_for(|| bridge.connection_count() == 1).await);
    assert!(bridge.connection(&ConnectionId::new("one")).is_none());
    assert!(bridge.connection(&ConnectionId::new("two")).is_some());

    server.shutdown();
    bridge.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_bridge_shutdown_closes_sockets() -> Result<()> {
    let bridge = Bridge::builder().build()?;
    let server = start(&bridge).await?;

    let mut client = connect(&server, "c3/page.html").await?;
    assert!(wait_for(|| bridge.connection_count() == 1).await);

    bridge.shutdown();

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    server.shutdown();
    Ok(())
}
