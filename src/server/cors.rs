//! CORS origin checking: loopback origins are always allowed; `OLLAMA_ORIGINS`
//! adds further allowed origins. Generalizes the teacher's blanket
//! `access-control-allow-origin: *` into a real allow-list, since this
//! daemon accepts requests on more than `localhost` by default.

pub fn is_allowed_origin(origin: &str, extra_origins: &[String]) -> bool {
    if is_loopback_origin(origin) {
        return true;
    }
    extra_origins.iter().any(|allowed| allowed == origin || allowed == "*")
}

fn is_loopback_origin(origin: &str) -> bool {
    let Some(host_port) = origin.split("://").nth(1) else {
        return false;
    };
    let host = host_port.split(':').next().unwrap_or(host_port);
    host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_origins_always_allowed() {
        assert!(is_allowed_origin("http://localhost:5173", &[]));
        assert!(is_allowed_origin("https://127.0.0.1:8080", &[]));
    }

    #[test]
    fn non_loopback_rejected_without_allow_list() {
        assert!(!is_allowed_origin("https://evil.example.com", &[]));
    }

    #[test]
    fn extra_origins_are_honored() {
        let extra = vec!["https://my-frontend.example.com".to_string()];
        assert!(is_allowed_origin("https://my-frontend.example.com", &extra));
        assert!(!is_allowed_origin("https://other.example.com", &extra));
    }
}
