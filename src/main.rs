mod db;
mod frame;
mod routes;
mod rules;
mod services;
mod state;
mod store;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let state = state::AppState::new(pool);

    // Bring unfinished games back so the lobby and rejoin survive restarts.
    let hydrated = services::persistence::hydrate_unfinished(&state)
        .await
        .expect("game hydration failed");
    tracing::info!(hydrated, "unfinished games loaded from database");

    // Spawn background persistence task.
    let _persistence = services::persistence::spawn_persistence_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "gridlock listening");
    axum::serve(listener, app).await.expect("server failed");
}
