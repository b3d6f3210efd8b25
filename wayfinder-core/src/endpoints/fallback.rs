use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Browsers probe this constantly; answer cheaply instead of burning a
/// gateway round-trip.
pub async fn favicon_handler() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn favicon_is_a_204() {
        let response = favicon_handler().await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
