use crate::{
    error::{ApiError, Reply},
    identity::{IdentityError, IdentityProvider},
    metadata::{Lookup, Omdb},
    model::{MovieItem, MovieRecord},
    watchlist::{Added, WatchlistError, Watchlists},
};
use actix_cors::Cors;
use actix_web::{
    dev::Payload,
    http::{header, StatusCode},
    web, FromRequest, HttpRequest, HttpResponse,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use std::sync::Arc;

pub struct AppState {
    pub watchlists: Watchlists,
    pub identity: Arc<dyn IdentityProvider>,
    /// `None` when no metadata API key is configured.
    pub metadata: Option<Omdb>,
}

type State = web::Data<AppState>;

/// Credential from the `Authorization` header. The `Bearer ` prefix is optional.
pub struct Bearer(String);

impl FromRequest for Bearer {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let credential = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim())
            .filter(|value| !value.is_empty());
        ready(match credential {
            Some(credential) => Ok(Bearer(credential.to_owned())),
            None => Err(ApiError::Unauthorized),
        })
    }
}

/// Runs store access on the blocking pool.
async fn blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    web::block(f).await?
}

fn authorize(state: &AppState, username: &str, bearer: &Bearer) -> Result<(), ApiError> {
    if state.identity.verify(username, &bearer.0)? {
        Ok(())
    } else {
        warn!("Token validation failed for user: {}", username);
        Err(ApiError::Unauthorized)
    }
}

#[derive(Deserialize)]
pub struct Credentials {
    username: String,
    password: String,
}

#[derive(Deserialize)]
pub struct UsernameBody {
    username: String,
}

#[derive(Deserialize)]
pub struct AddRequest {
    username: String,
    item: MovieItem,
}

#[derive(Deserialize)]
pub struct UsernameQuery {
    username: String,
}

#[derive(Deserialize)]
pub struct MovieQuery {
    username: String,
    #[serde(rename = "imdbID")]
    movie_id: String,
}

#[derive(Deserialize)]
pub struct MostSavedQuery {
    n: usize,
}

fn first_page() -> u32 {
    1
}

fn short_plot() -> String {
    "short".to_owned()
}

#[derive(Deserialize)]
pub struct SearchQuery {
    title: String,
    #[serde(default = "first_page")]
    page: u32,
}

#[derive(Deserialize)]
pub struct TitleQuery {
    movie_id: String,
    #[serde(default = "short_plot")]
    plot: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenReply {
    pub status_code: u16,
    pub message: String,
    pub token: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FoundReply {
    pub status_code: u16,
    pub message: String,
    pub found: bool,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WatchlistReply {
    pub status_code: u16,
    pub watchlist: Vec<MovieRecord>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MostSavedReply {
    pub status_code: u16,
    pub movie_list: Vec<MovieRecord>,
}

async fn register(state: State, body: web::Json<Credentials>) -> Result<HttpResponse, ApiError> {
    let Credentials { username, password } = body.into_inner();
    let message = blocking(move || {
        state.identity.register(&username, &password)?;
        Ok(format!("Registered user: {}", username))
    })
    .await?;
    Ok(Reply::ok(message))
}

async fn login(state: State, body: web::Json<Credentials>) -> Result<HttpResponse, ApiError> {
    let Credentials { username, password } = body.into_inner();
    let token = blocking(move || Ok(state.identity.sign_in(&username, &password)?)).await?;
    Ok(HttpResponse::Ok().json(TokenReply {
        status_code: StatusCode::OK.as_u16(),
        message: "Signed in".to_owned(),
        token,
    }))
}

async fn logout(state: State, bearer: Bearer) -> Result<HttpResponse, ApiError> {
    if blocking(move || Ok(state.identity.sign_out(&bearer.0)?)).await? {
        Ok(Reply::ok("Signed out"))
    } else {
        Err(ApiError::Unauthorized)
    }
}

async fn create_watchlist(
    state: State,
    body: web::Json<UsernameBody>,
) -> Result<HttpResponse, ApiError> {
    let username = body.into_inner().username;
    let message = blocking(move || {
        if !state.identity.is_user(&username)? {
            return Err(IdentityError::UnknownUser(username).into());
        }
        state.watchlists.create(&username)?;
        Ok(format!("Watchlist created for user: {}", username))
    })
    .await?;
    Ok(Reply::ok(message))
}

async fn add_to_watchlist(
    state: State,
    bearer: Bearer,
    body: web::Json<AddRequest>,
) -> Result<HttpResponse, ApiError> {
    let AddRequest { username, item } = body.into_inner();
    let added = blocking(move || {
        authorize(&state, &username, &bearer)?;
        Ok(state.watchlists.add(&username, &item)?)
    })
    .await?;
    Ok(Reply::ok(match added {
        Added::Inserted { .. } => "Added movie to watchlist!",
        Added::AlreadyListed => "Movie is already in the watchlist.",
    }))
}

async fn remove_from_watchlist(
    state: State,
    bearer: Bearer,
    query: web::Query<MovieQuery>,
) -> Result<HttpResponse, ApiError> {
    let MovieQuery { username, movie_id } = query.into_inner();
    blocking(move || {
        authorize(&state, &username, &bearer)?;
        state.watchlists.remove(&username, &movie_id)?;
        Ok(())
    })
    .await?;
    Ok(Reply::ok("Removed movie from watchlist!"))
}

async fn is_in_watchlist(
    state: State,
    bearer: Bearer,
    query: web::Query<MovieQuery>,
) -> Result<HttpResponse, ApiError> {
    let MovieQuery { username, movie_id } = query.into_inner();
    let found = blocking(move || {
        authorize(&state, &username, &bearer)?;
        match state.watchlists.contains(&username, &movie_id) {
            Err(WatchlistError::WatchlistNotFound(_)) => Ok(false),
            found => Ok(found?),
        }
    })
    .await?;
    let (status, message) = if found {
        (StatusCode::OK, "the movie or series is on the watchlist!")
    } else {
        (StatusCode::NOT_FOUND, "the movie or series is not on the watchlist!")
    };
    Ok(HttpResponse::build(status).json(FoundReply {
        status_code: status.as_u16(),
        message: message.to_owned(),
        found,
    }))
}

async fn get_watchlist(
    state: State,
    bearer: Bearer,
    query: web::Query<UsernameQuery>,
) -> Result<HttpResponse, ApiError> {
    let username = query.into_inner().username;
    let watchlist = blocking(move || {
        authorize(&state, &username, &bearer)?;
        Ok(state.watchlists.get(&username)?)
    })
    .await?;
    Ok(HttpResponse::Ok().json(WatchlistReply {
        status_code: StatusCode::OK.as_u16(),
        watchlist,
    }))
}

async fn most_saved(
    state: State,
    query: web::Query<MostSavedQuery>,
) -> Result<HttpResponse, ApiError> {
    let n = query.n;
    let movie_list = blocking(move || Ok(state.watchlists.most_saved(n)?)).await?;
    Ok(HttpResponse::Ok().json(MostSavedReply {
        status_code: StatusCode::OK.as_u16(),
        movie_list,
    }))
}

async fn delete_account(
    state: State,
    bearer: Bearer,
    query: web::Query<UsernameQuery>,
) -> Result<HttpResponse, ApiError> {
    let username = query.into_inner().username;
    let account = username.clone();
    let deletion = blocking(move || {
        authorize(&state, &username, &bearer)?;
        Ok(state
            .watchlists
            .delete_account(state.identity.as_ref(), &username, &bearer.0)?)
    })
    .await?;
    debug!("Account deletion of {}: {:?}", account, deletion.released);
    match deletion.identity {
        Ok(()) => Ok(Reply::ok(format!(
            "Successfully deleted account of user: {}",
            account
        ))),
        Err(err) => Err(ApiError::IdentityDeletion(err)),
    }
}

fn passthrough(lookup: Lookup) -> HttpResponse {
    let status = StatusCode::from_u16(lookup.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(lookup.body)
}

async fn search(state: State, query: web::Query<SearchQuery>) -> Result<HttpResponse, ApiError> {
    let omdb = state.metadata.as_ref().ok_or(ApiError::MetadataDisabled)?;
    Ok(passthrough(omdb.search(&query.title, query.page).await))
}

async fn movie(state: State, query: web::Query<TitleQuery>) -> Result<HttpResponse, ApiError> {
    let omdb = state.metadata.as_ref().ok_or(ApiError::MetadataDisabled)?;
    Ok(passthrough(omdb.title(&query.movie_id, &query.plot).await))
}

/// CORS for the frontend origin, including answers to preflight requests.
pub fn cors(origin: &str) -> Cors {
    Cors::default()
        .allowed_origin(origin)
        .allowed_methods(vec!["GET", "POST", "PUT", "DELETE"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
        .allowed_header("x-requested-with")
        .supports_credentials()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/register", web::post().to(register))
        .route("/login", web::post().to(login))
        .route("/logout", web::post().to(logout))
        .route("/createWatchlist", web::post().to(create_watchlist))
        .route("/addToWatchlist", web::post().to(add_to_watchlist))
        .route("/removeFromWatchlist", web::delete().to(remove_from_watchlist))
        .route("/isInWatchlist", web::get().to(is_in_watchlist))
        .route("/Watchlist", web::get().to(get_watchlist))
        .route("/MostSaved", web::get().to(most_saved))
        .route("/DeleteAccount", web::delete().to(delete_account))
        .route("/search", web::get().to(search))
        .route("/movie", web::get().to(movie));
}
