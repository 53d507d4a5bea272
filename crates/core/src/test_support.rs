//! Throwaway HTTP responders for exercising the HTTP clients in tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn http_response(status_line: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Same as [`http_response`] for bodies that are not valid UTF-8.
pub fn http_response_bytes(status_line: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Answers exactly one connection with `response` and returns the base URL (`http://host:port`).
pub async fn serve_once(response: impl Into<Vec<u8>>) -> String {
    serve_sequence(vec![response.into()]).await
}

/// Answers one connection per response, in order.
pub async fn serve_sequence(responses: Vec<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for response in responses {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            answer(socket, &response).await;
        }
    });
    format!("http://{addr}")
}

async fn answer(mut socket: TcpStream, response: &[u8]) {
    let mut request = Vec::new();
    let mut buffer = [0u8; 4096];
    // Read until the headers and the declared body have arrived.
    loop {
        let Ok(read) = socket.read(&mut buffer).await else {
            break;
        };
        if read == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..read]);
        if request_complete(&request) {
            break;
        }
    }
    let _ = socket.write_all(response).await;
    let _ = socket.shutdown().await;
}

/// Accepts one connection and never answers it.
pub async fn serve_silence() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            drop(socket);
        }
    });
    format!("http://{addr}")
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    request.len() >= header_end + 4 + content_length
}
