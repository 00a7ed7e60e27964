use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::config::ServerConfig;

use super::inference::InferenceClient;

// The query the original service streamed on every map view.
const MAPVIEW_QUERY: &str = "Map data processing query";

struct AppState {
    templates: tera::Tera,
    inference: InferenceClient,
}

/// Run the HTTP surface: a landing page and a map view backed by the
/// inference pipeline. Blocks until the server shuts down.
pub fn run(config: &ServerConfig) -> anyhow::Result<()> {
    let inference_config = config
        .inference
        .as_ref()
        .context("server.inference must be configured to serve /mapview")?;
    let inference = InferenceClient::from_config(inference_config)?;
    let templates = tera::Tera::new(&format!(
        "{}/**/*.html",
        config.templates_dir.display()
    ))
    .context("loading templates")?;
    let state = Arc::new(AppState {
        templates,
        inference,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(state, &config.bind_addr))
}

async fn serve(state: Arc<AppState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(index))
        .route("/mapview", get(mapview))
        .with_state(state);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    log::info!("Listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index(State(state): State<Arc<AppState>>) -> Response {
    render(&state, "index.html", tera::Context::new())
}

async fn mapview(State(state): State<Arc<AppState>>) -> Response {
    let inference = state.inference.clone();
    // The inference client is blocking; keep it off the async workers.
    let output = tokio::task::spawn_blocking(move || inference.stream_row(MAPVIEW_QUERY)).await;
    let output = match output {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            log::error!("Inference call failed: {:?}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("inference call failed: {}", err),
            )
                .into_response();
        }
        Err(err) => {
            log::error!("Inference task panicked: {:?}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "inference task failed".to_string(),
            )
                .into_response();
        }
    };

    let mut context = tera::Context::new();
    context.insert("inference_output", &output);
    render(&state, "map.html", context)
}

fn render(state: &AppState, template: &str, context: tera::Context) -> Response {
    match state.templates.render(template, &context) {
        Ok(body) => Html(body).into_response(),
        Err(err) => {
            log::error!("Template '{}' failed to render: {:?}", template, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("error rendering template: {}", err),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_bundled_templates_render() {
        let templates = tera::Tera::new("templates/**/*.html").unwrap();

        let index = templates.render("index.html", &tera::Context::new()).unwrap();
        assert!(index.contains("/mapview"));

        let mut context = tera::Context::new();
        context.insert("inference_output", "the pipeline says hi");
        let map = templates.render("map.html", &context).unwrap();
        assert!(map.contains("the pipeline says hi"));
    }
}
