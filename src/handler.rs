// src/handler.rs
use crate::http::Request;

/// Application seam: a pure function from decoded request to response body.
/// An empty body means "no route here"; the server turns that into 404 for
/// GET and 400 for anything else.
pub type Handler = fn(&Request) -> Vec<u8>;

const WELCOME_PAGE: &str = "<html><head><title>High-Performance HTTP Server</title></head>\
<body><h1>Welcome to the high-performance HTTP server</h1>\
<p>Linux epoll reactor with a fixed worker pool</p>\
<p>Target: 10 000+ requests/second</p>\
<p>HTTP/1.1 with keep-alive</p>\
</body></html>";

/// Default handler: GET on `/` or `/index.html` serves the welcome page.
pub fn welcome(req: &Request) -> Vec<u8> {
    if req.method != "GET" {
        return Vec::new();
    }
    match req.path.as_str() {
        "/" | "/index.html" => WELCOME_PAGE.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            ..Request::default()
        }
    }

    #[test]
    fn root_and_index_serve_the_welcome_page() {
        assert!(!welcome(&request("GET", "/")).is_empty());
        assert_eq!(
            welcome(&request("GET", "/")),
            welcome(&request("GET", "/index.html"))
        );
    }

    #[test]
    fn unknown_paths_and_methods_yield_empty() {
        assert!(welcome(&request("GET", "/missing")).is_empty());
        assert!(welcome(&request("POST", "/")).is_empty());
        assert!(welcome(&request("HEAD", "/index.html")).is_empty());
    }
}
