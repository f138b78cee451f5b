use crate::{identity::IdentityError, watchlist::WatchlistError};
use actix_web::{error::BlockingError, http::StatusCode, HttpResponse, ResponseError};
use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body of every response that carries no data besides its outcome.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub status_code: u16,
    pub message: String,
}

impl Reply {
    pub fn ok<S: Into<String>>(message: S) -> HttpResponse {
        HttpResponse::Ok().json(Reply {
            status_code: StatusCode::OK.as_u16(),
            message: message.into(),
        })
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Watchlist(#[from] WatchlistError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Token validation error")]
    Unauthorized,

    #[error("Watchlist deleted, but the account could not be deleted: {0}")]
    IdentityDeletion(IdentityError),

    #[error("Movie search is not configured")]
    MetadataDisabled,

    #[error("Worker pool error")]
    Blocking(#[from] BlockingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Watchlist(err) => match err {
                WatchlistError::AlreadyExists(_) => StatusCode::CONFLICT,
                WatchlistError::WatchlistNotFound(_)
                | WatchlistError::NotInWatchlist { .. }
                | WatchlistError::MovieNotFound(_) => StatusCode::NOT_FOUND,
                WatchlistError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                WatchlistError::Timeout
                | WatchlistError::Storage(_)
                | WatchlistError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Identity(err) => match err {
                IdentityError::UsernameTaken(_) => StatusCode::CONFLICT,
                IdentityError::BadCredentials => StatusCode::UNAUTHORIZED,
                IdentityError::UnknownUser(_) => StatusCode::NOT_FOUND,
                IdentityError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                IdentityError::Storage(_) | IdentityError::Codec(_) | IdentityError::Hash(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::IdentityDeletion(_) => StatusCode::BAD_GATEWAY,
            ApiError::MetadataDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Blocking(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("{}", self);
            "Server error: could not complete the request".to_owned()
        } else {
            self.to_string()
        };
        HttpResponse::build(status).json(Reply {
            status_code: status.as_u16(),
            message,
        })
    }
}
