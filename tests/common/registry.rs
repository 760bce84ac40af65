use std::{
    collections::HashMap,
    io::Read,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use ch_image::MediaType;
use tiny_http::{Header, Method, Request, Response, Server};

use super::blobs::Blob;

pub const ARCH: &str = "ARCH";

pub const OS: &str = "OS";

/// State of a registry, shared with the tests.
#[derive(Default)]
pub struct RegistryState {
    /// Number of `GET` requests for the manifest.
    pub manifest_requests: AtomicUsize,

    /// Blobs received with `PUT`, by their digest.
    pub uploaded_blobs: Mutex<HashMap<String, Vec<u8>>>,

    /// Manifests received with `PUT`, by their tag.
    pub uploaded_manifests: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl RegistryState {
    pub fn manifest_requests(&self) -> usize {
        self.manifest_requests.load(Ordering::SeqCst)
    }
}

/// Start a registry server in a random port.
///
/// Returns the port number of the server, and its state.
pub fn start_registry(
    repository: &'static str,
    tag: &'static str,
    config: Blob,
    layers: Vec<Blob>,
) -> (u16, Arc<RegistryState>) {
    let server = Server::http("127.1:0").expect("start registry server");
    let port = server.server_addr().to_ip().unwrap().port();

    let state = Arc::new(RegistryState::default());
    let registry = Registry::new(server, repository, tag, config, layers, state.clone());

    std::thread::spawn(move || registry.run());

    (port, state)
}

struct Registry {
    server: Server,
    manifest_path: String,
    manifests_prefix: String,
    blobs_prefix: String,
    uploads_prefix: String,
    config: Blob,
    layers: Vec<Blob>,
    state: Arc<RegistryState>,
    next_upload: usize,
}

impl Registry {
    fn new(
        server: Server,
        repository: &'static str,
        tag: &'static str,
        config: Blob,
        layers: Vec<Blob>,
        state: Arc<RegistryState>,
    ) -> Registry {
        Registry {
            server,
            manifest_path: format!("/v2/{repository}/manifests/{tag}"),
            manifests_prefix: format!("/v2/{repository}/manifests/"),
            blobs_prefix: format!("/v2/{repository}/blobs/sha256:"),
            uploads_prefix: format!("/v2/{repository}/blobs/uploads/"),
            config,
            layers,
            state,
            next_upload: 0,
        }
    }

    fn run(mut self) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = self.server.recv_timeout(timeout) {
            self.handle(request);
        }
    }

    fn handle(&mut self, request: Request) {
        let method = request.method().clone();
        let url = request.url().to_owned();

        match method {
            Method::Get if url == self.manifest_path => {
                self.state.manifest_requests.fetch_add(1, Ordering::SeqCst);
                self.manifest(request);
            }

            Method::Get => match url.strip_prefix(&self.blobs_prefix) {
                Some(digest) => match self.find_blob(digest) {
                    Some(blob) => Self::send_body(request, blob.media_type, blob.data.clone()),
                    None => Self::send_status(request, 404),
                },

                None => Self::send_status(request, 404),
            },

            Method::Head => {
                let known = url
                    .strip_prefix(&self.blobs_prefix)
                    .is_some_and(|digest| self.has_blob(digest));

                Self::send_status(request, if known { 200 } else { 404 });
            }

            Method::Post if url == self.uploads_prefix => {
                self.next_upload += 1;

                let location = format!("{}{}", self.uploads_prefix, self.next_upload);
                let response = Response::empty(202)
                    .with_header(Header::from_bytes("Location", location).unwrap());

                request.respond(response).expect("Send response");
            }

            Method::Put if url.starts_with(&self.uploads_prefix) => self.receive_blob(request),

            Method::Put if url.starts_with(&self.manifests_prefix) => {
                self.receive_manifest(request)
            }

            _ => Self::send_status(request, 405),
        }
    }

    fn manifest(&self, request: Request) {
        #[derive(serde::Serialize, Debug)]
        #[serde(rename_all = "camelCase")]
        struct Image<'a> {
            schema_version: u32,
            config: &'a Blob,
            layers: &'a [Blob],
        }

        Self::send_json(
            request,
            MediaType::OciManifestV1,
            Image {
                schema_version: 2,
                config: &self.config,
                layers: &self.layers,
            },
        );
    }

    fn find_blob(&self, digest: &str) -> Option<&Blob> {
        if self.config.digest == digest {
            return Some(&self.config);
        }

        self.layers.iter().find(|l| l.digest == digest)
    }

    fn has_blob(&self, digest: &str) -> bool {
        self.find_blob(digest).is_some()
            || self
                .state
                .uploaded_blobs
                .lock()
                .unwrap()
                .contains_key(&format!("sha256:{digest}"))
    }

    fn receive_blob(&self, mut request: Request) {
        let url = url::Url::parse(&format!("http://registry{}", request.url())).unwrap();

        let digest = url
            .query_pairs()
            .find(|(k, _)| k == "digest")
            .map(|(_, v)| v.into_owned())
            .expect("digest in upload URL");

        let mut data = Vec::new();
        request.as_reader().read_to_end(&mut data).unwrap();

        self.state
            .uploaded_blobs
            .lock()
            .unwrap()
            .insert(digest, data);

        Self::send_status(request, 201);
    }

    fn receive_manifest(&self, mut request: Request) {
        let tag = request.url()[self.manifests_prefix.len()..].to_owned();

        let content_type = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("Content-Type"))
            .map(|h| h.value.to_string())
            .unwrap_or_default();

        let mut data = Vec::new();
        request.as_reader().read_to_end(&mut data).unwrap();

        self.state
            .uploaded_manifests
            .lock()
            .unwrap()
            .insert(tag, (content_type, data));

        Self::send_status(request, 201);
    }

    fn send_json(request: Request, media_type: MediaType, body: impl serde::Serialize) {
        let body = serde_json::to_vec(&body).expect("Serialize JSON");
        Self::send_body(request, media_type, body);
    }

    fn send_body(request: Request, media_type: MediaType, body: impl Into<Vec<u8>>) {
        let response = Response::from_data(body)
            .with_status_code(200)
            .with_header(Header::from_bytes("Content-Type", media_type.as_str()).unwrap());

        request.respond(response).expect("Send response");
    }

    fn send_status(request: Request, status: u16) {
        request
            .respond(Response::empty(status))
            .expect("Send response");
    }
}
