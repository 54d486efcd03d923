//! Live HTTP probe exercise against a public endpoint.
//!
//! Requires outbound internet access:
//!
//!     cargo test --test http_probe_live -- --ignored

use globalping::probe::http::{do_probe, event_name, HttpProbeRequest, HttpProto};
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires internet reachability"]
async fn http2_get_with_size_limit_produces_ordered_event_stream() {
    let request = HttpProbeRequest {
        url: "https://www.google.com/robots.txt".into(),
        proto: Some(HttpProto::Http2),
        size_limit: Some(4096),
        correlation_id: "live-h2".into(),
        ..Default::default()
    };

    let mut events = do_probe(request, CancellationToken::new());
    let mut names = Vec::new();
    let mut body_bytes_read: Option<u64> = None;
    let mut chunk_bytes: u64 = 0;

    while let Some(event) = events.recv().await {
        assert_eq!(event.correlation_id, "live-h2");
        assert!(event.error.is_none(), "probe failed: {:?}", event.error);
        let transport = event.transport.unwrap();
        if transport.name == event_name::BODY_CHUNK_BASE64 {
            use base64::Engine;
            chunk_bytes += base64::engine::general_purpose::STANDARD
                .decode(&transport.value)
                .unwrap()
                .len() as u64;
        }
        if transport.name == event_name::BODY_BYTES_READ {
            body_bytes_read = Some(transport.value.parse().unwrap());
        }
        names.push(transport.name);
    }

    // The event vocabulary arrives in request → response → body order.
    let position = |name: &str| {
        names
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("missing event {name}"))
    };

    assert!(position(event_name::METHOD) < position(event_name::REQUEST_HEADERS_START));
    assert!(
        position(event_name::REQUEST_HEADERS_START) < position(event_name::REQUEST_HEADERS_END)
    );
    assert!(position(event_name::REQUEST_HEADERS_END) < position(event_name::STATUS));
    assert!(
        position(event_name::RESPONSE_HEADERS_START) < position(event_name::RESPONSE_HEADERS_END)
    );
    assert!(position(event_name::RESPONSE_HEADERS_END) < position(event_name::BODY_START));
    assert!(position(event_name::BODY_START) < position(event_name::BODY_END));

    assert!(names.iter().any(|n| n == event_name::REQUEST_HEADERS_START));
    assert!(names.iter().any(|n| n == event_name::BODY_CHUNK_BASE64));

    let read = body_bytes_read.expect("body-bytes-read event");
    assert_eq!(read, chunk_bytes);
    assert!(read <= 4096, "read {read} bytes past the size limit");
}
