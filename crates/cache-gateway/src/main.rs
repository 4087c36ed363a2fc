//! Cache gateway server

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use shared::{Config, EnvSecretResolver, InMemoryRateLimitCounter, RateLimitCounter, RedisRateLimitCounter};
use std::sync::Arc;
use std::time::Duration;
use tracing_actix_web::TracingLogger;

use cache_gateway::gateway::{
    CacheGateway, GatewayDependencies, HttpExecutorFactory, HttpServiceProbe,
};
use cache_gateway::middleware::{self, IdentityResolver, JwtIdentityResolver, TrustedProxies};
use cache_gateway::routes;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    shared::init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    middleware::init_metrics().context("Failed to initialize metrics")?;

    tracing::info!("Starting cache gateway...");

    let counter: Arc<dyn RateLimitCounter> = match &config.redis.url {
        Some(url) => {
            let manager = shared::redis::create_client(url)
                .await
                .context("Failed to connect to rate-limit Redis")?;
            tracing::info!("Rate limits counted in Redis");
            Arc::new(RedisRateLimitCounter::new(manager))
        }
        None => {
            tracing::warn!("REDIS_URL not set, counting rate limits in process memory");
            Arc::new(InMemoryRateLimitCounter::new())
        }
    };

    let executors = HttpExecutorFactory::new(Duration::from_secs(config.cache.request_timeout_secs))
        .context("Failed to create backend HTTP client")?;
    let probe = HttpServiceProbe::new(executors.client().clone());

    let gateway = web::Data::new(CacheGateway::new(
        &config.cache,
        config.services.clone(),
        GatewayDependencies {
            secrets: Arc::new(EnvSecretResolver::new()),
            executors: Arc::new(executors),
            counter,
            probe: Arc::new(probe),
        },
    ));
    let identity: Arc<dyn IdentityResolver> =
        Arc::new(JwtIdentityResolver::new(&config.auth.jwt_secret));
    let identity = web::Data::from(identity);
    let proxies = web::Data::new(TrustedProxies::from_env());

    let server_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Cache gateway listening on {}", server_addr);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::HttpMetrics)
            .wrap(middleware::cors())
            .wrap(middleware::RequestId)
            .wrap(TracingLogger::default())
            .app_data(gateway.clone())
            .app_data(identity.clone())
            .app_data(proxies.clone())
            .configure(routes::configure)
    })
    .bind(&server_addr)
    .with_context(|| format!("Failed to bind to {}", server_addr))?
    .run()
    .await
    .context("Server error")?;

    Ok(())
}
