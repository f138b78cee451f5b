mod config;
mod database;
mod error;
mod identity;
mod metadata;
mod model;
mod routes;
mod watchlist;

use actix_web::{middleware::Logger, web, App, HttpServer};
use config::Config;
use identity::LocalIdentity;
use log::info;
use metadata::Omdb;
use routes::AppState;
use std::{io, sync::Arc};
use watchlist::Watchlists;

fn startup_error<E: std::fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

#[actix_rt::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("moviehub=debug,actix_web=info"),
    )
    .init();

    let config = Config::from_env().map_err(startup_error)?;
    let db = config.open_db().map_err(startup_error)?;

    let state = web::Data::new(AppState {
        watchlists: Watchlists::open(&db, config.transaction_timeout).map_err(startup_error)?,
        identity: Arc::new(
            LocalIdentity::open(&db, config.bcrypt_cost, config.session_ttl)
                .map_err(startup_error)?,
        ),
        metadata: config
            .omdb_key
            .as_ref()
            .map(|key| Omdb::new(&config.omdb_url, key)),
    });

    let origin = config.allowed_origin.clone();
    info!("Server is running at http://{}", config.bind);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(routes::cors(&origin))
            .app_data(state.clone())
            .configure(routes::configure)
    })
    .bind(&config.bind)?
    .run()
    .await?;

    db.flush_async().await.map_err(startup_error)?;
    info!("Server shut down");
    Ok(())
}
