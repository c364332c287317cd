//! Server-sent events over a reqwest response body

use super::backend::{boxed_stream, TokenStream};
use futures_util::StreamExt;

/// Yields the payload of each `data:` line. `[DONE]` ends the stream; other
/// fields and blank lines are ignored.
pub fn data_lines(resp: reqwest::Response) -> TokenStream {
    let byte_stream = resp.bytes_stream();

    let sse_stream = async_stream::try_stream! {
        // Raw bytes: a multi-byte character may straddle two chunks.
        let mut buffer: Vec<u8> = Vec::new();
        futures_util::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
            buffer.extend_from_slice(&chunk);

            while let Some(line) = take_line(&mut buffer) {
                if let Some(data) = parse_data_line(&line) {
                    if data == "[DONE]" {
                        return;
                    }
                    yield data.to_string();
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer);
        if let Some(data) = parse_data_line(rest.trim()) {
            if data != "[DONE]" {
                yield data.to_string();
            }
        }
    };

    boxed_stream(sse_stream)
}

/// Removes the first complete line from `buffer` and decodes it.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let newline_pos = buffer.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

fn parse_data_line(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_data_prefix_with_and_without_space() {
        assert_eq!(parse_data_line("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_data_line("data:{}"), Some("{}"));
        assert_eq!(parse_data_line("event: ping"), None);
        assert_eq!(parse_data_line(""), None);
    }

    #[test]
    fn lines_wait_for_the_rest_of_a_split_character() {
        let mut buffer = b"data: caf\xC3".to_vec();
        assert_eq!(take_line(&mut buffer), None);

        buffer.extend_from_slice(b"\xA9\r\n\ndata: x");
        assert_eq!(take_line(&mut buffer).as_deref(), Some("data: café"));
        assert_eq!(take_line(&mut buffer).as_deref(), Some(""));
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"data: x");
    }

    #[tokio::test]
    async fn chunked_multibyte_text_survives() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/events")
            .with_header("content-type", "text/event-stream")
            .with_chunked_body(|w| {
                w.write_all(b"data: caf\xC3")?;
                w.write_all(b"\xA9\n\ndata: \xE4\xBD")?;
                w.write_all(b"\xA0\xE5\xA5\xBD\n\n")
            })
            .create_async()
            .await;

        let resp = reqwest::get(format!("{}/events", server.url())).await.unwrap();
        let items: Vec<String> = data_lines(resp).map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec!["café", "你好"]);
    }

    #[tokio::test]
    async fn splits_body_into_payloads() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/events")
            .with_header("content-type", "text/event-stream")
            .with_body("data: one\n\n: comment\ndata: two\n\ndata: [DONE]\n\ndata: ignored\n")
            .create_async()
            .await;

        let resp = reqwest::get(format!("{}/events", server.url())).await.unwrap();
        let items: Vec<String> = data_lines(resp).map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec!["one", "two"]);
    }
}
