//! Aggregated API documentation endpoints

use axum::{
    extract::{Path, State},
    response::{Html, IntoResponse, Json, Response},
};
use serde_json::Value;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::metrics::get_metrics;
use crate::openapi::DocAggregator;

/// Path of the merged document, relative to `/docs`
pub const DOC_JSON: &str = "doc.json";

const SWAGGER_UI: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>API Gateway</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js" crossorigin></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: "/docs/doc.json", dom_id: "#swagger-ui" });
    };
  </script>
</body>
</html>
"##;

/// Documentation handlers
#[derive(Debug, Clone)]
pub struct DocsHandlers {
    aggregator: Arc<DocAggregator>,
}

impl DocsHandlers {
    #[must_use]
    pub fn new(aggregator: Arc<DocAggregator>) -> Self {
        Self { aggregator }
    }

    /// Merged document, rebuilt from the upstreams on every call
    pub async fn doc_json(State(handlers): State<Self>) -> Result<Json<Value>, GatewayError> {
        let result = handlers.aggregator.aggregate().await;
        get_metrics().record_doc_aggregation(result.is_ok());
        result.map(Json)
    }

    /// Swagger UI page
    pub async fn ui() -> Html<&'static str> {
        Html(SWAGGER_UI)
    }

    /// Everything under `/docs/`: the merged document or the UI page
    pub async fn asset(State(handlers): State<Self>, Path(rest): Path<String>) -> Response {
        if rest == DOC_JSON {
            Self::doc_json(State(handlers)).await.into_response()
        } else {
            Self::ui().await.into_response()
        }
    }
}
