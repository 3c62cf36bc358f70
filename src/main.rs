use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::time::interval;

use rategate::{
    api::{create_api_router, AppContext},
    config::Config,
    limiter::RateLimiter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    tracing::info!("Starting rategate");

    let config = Config::from_env()?;
    let rate_limiter = RateLimiter::new(&config.rate_limit)?;

    let sweeper = rate_limiter.clone();
    let sweep_interval_ms = config.rate_limit.sweep_interval_ms;

    tokio::spawn(async move {
        let mut interval = interval(Duration::from_millis(sweep_interval_ms));

        loop {
            interval.tick().await;
            let evicted = sweeper.sweep();

            if evicted > 0 {
                tracing::info!(
                    "Swept {} idle client(s), {} still tracked",
                    evicted,
                    sweeper.tracked_keys()
                );
            }
        }
    });

    let context = AppContext {
        config: config.clone(),
        rate_limiter,
    };

    let app: Router = create_api_router(context);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    tracing::info!("rategate running on http://{}", addr);
    tracing::info!(
        "Rate limit: {} requests per {}ms sliding window",
        config.rate_limit.max_requests,
        config.rate_limit.window_ms
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
