use std::{
    collections::HashMap,
    io::Read,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use tiny_http::{Header, Request, Response, Server};

use crate::{Digest, EventHandler, ImageRef, NoEventHandler};

/// Serve requests with `handler` in a background thread, until the test
/// process exits or no request is received for a minute.
///
/// Returns the port of the server.
fn serve<F>(handler: F) -> u16
where
    F: Fn(u16, Request) + Send + 'static,
{
    let server = Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();

    thread::spawn(move || {
        while let Ok(Some(request)) = server.recv_timeout(Duration::from_secs(60)) {
            handler(port, request);
        }
    });

    port
}

fn header(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.to_string())
}

fn client(port: u16, event_handler: Arc<dyn EventHandler>) -> super::Client {
    let reference = ImageRef::parse(&format!("127.0.0.1:{port}/abc/def")).unwrap();
    super::Client::new(&reference, event_handler)
}

#[test]
fn request_token_after_unauthorized() {
    let port = serve(|port, request| {
        let url = url::Url::parse(&format!("http://localhost{}", request.url())).unwrap();

        let response = match (url.path(), header(&request, "Authorization")) {
            ("/auth", None) => {
                let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
                assert_eq!(query.len(), 2);
                assert_eq!(query["service"], "test-registry");
                assert_eq!(query["scope"], "repository:abc/def:pull");

                Response::from_string(r#"{"token": "T0K3N", "expires_in": 300}"#)
            }

            ("/v2/abc/def/manifests/1.0", None) => {
                let challenge = format!(
                    r#"Bearer realm="http://127.0.0.1:{port}/auth",service="test-registry",scope="repository:abc/def:pull""#
                );

                Response::from_string("")
                    .with_status_code(401)
                    .with_header(Header::from_bytes("WWW-Authenticate", challenge).unwrap())
            }

            ("/v2/abc/def/manifests/1.0", Some(auth)) => Response::from_string(auth),

            _ => Response::from_string("").with_status_code(404),
        };

        request.respond(response).unwrap();
    });

    // The first request gets a 401, and it is repeated with the token.
    let response = client(port, Arc::new(NoEventHandler))
        .get("manifests/1.0", None)
        .unwrap();

    assert_eq!(response.into_string().unwrap(), "Bearer T0K3N");
}

#[test]
fn upload_blob_to_location() {
    struct Requests(Arc<AtomicUsize>);

    impl EventHandler for Requests {
        fn registry_request(&self, _method: &str, _url: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let digest = Digest::sha256([0u8; 32]);
    let expected_digest = digest.source().to_owned();

    let port = serve(move |_, mut request| {
        let method = request.method().as_str().to_owned();
        let url = url::Url::parse(&format!("http://localhost{}", request.url())).unwrap();

        let response = match (method.as_str(), url.path()) {
            ("POST", "/v2/abc/def/blobs/uploads/") => Response::from_string("")
                .with_status_code(202)
                .with_header(Header::from_bytes("Location", "/uploads/42?session=s1").unwrap()),

            ("PUT", "/uploads/42") => {
                let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
                assert_eq!(query["session"], "s1");
                assert_eq!(query["digest"], expected_digest);

                let mut body = Vec::new();
                request.as_reader().read_to_end(&mut body).unwrap();
                assert_eq!(body, b"layer-data");

                Response::from_string("").with_status_code(201)
            }

            _ => Response::from_string("").with_status_code(404),
        };

        request.respond(response).unwrap();
    });

    let requests = Arc::new(AtomicUsize::new(0));
    let client = client(port, Arc::new(Requests(requests.clone())));

    client.upload_blob(&digest, b"layer-data").unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 2);

    // HEAD receives a 404 for unknown blobs.
    assert!(!client.has_blob(&digest).unwrap());
}
