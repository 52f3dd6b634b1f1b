//! News Stage (§4.D).
//!
//! Consumes broadcast `NewsArticle` events, resolves a single best
//! symbol per article (cheap hint parse, falling back to the
//! TickerExtractor collaborator on miss or ambiguity), and emits at
//! most one `TickerEvent` per article. Duplicate `(symbol, articleId)`
//! pairs within 60 s are dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::bridge::NewsArticle;
use crate::extractor::TickerExtractor;
use crate::model::{Symbol, TickerEvent};
use crate::shutdown::Shutdown;

const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Resolves the hint field to an unambiguous symbol, or `None` if the
/// hint is empty or carries more than one candidate.
fn resolve_from_hint(hint: &[String]) -> Option<Symbol> {
    let mut symbols = hint.iter().filter_map(|s| Symbol::parse(s));
    let first = symbols.next()?;
    match symbols.next() {
        Some(_) => None,
        None => Some(first),
    }
}

pub struct NewsStage {
    extractor: TickerExtractor,
}

impl NewsStage {
    #[must_use]
    pub fn new(extractor: TickerExtractor) -> Self {
        Self { extractor }
    }

    pub async fn run(
        self,
        mut articles: broadcast::Receiver<NewsArticle>,
        out: mpsc::Sender<TickerEvent>,
        mut shutdown: Shutdown,
    ) {
        let mut recent: HashMap<(Symbol, String), Instant> = HashMap::new();
        loop {
            tokio::select! {
                article = articles.recv() => {
                    let article = match article {
                        Ok(article) => article,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "news stage lagged, dropped articles");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    };
                    self.handle(article, &mut recent, &out).await;
                }
                () = shutdown.recv() => return,
            }
        }
    }

    async fn handle(
        &self,
        article: NewsArticle,
        recent: &mut HashMap<(Symbol, String), Instant>,
        out: &mpsc::Sender<TickerEvent>,
    ) {
        let symbol = match resolve_from_hint(&article.symbols_hint) {
            Some(symbol) => Some(symbol),
            None => match self.extractor.extract(&article.body, &article.symbols_hint).await {
                Ok(symbol) => symbol,
                Err(err) => {
                    warn!(%err, article_id = %article.article_id, "ticker extraction failed");
                    None
                }
            },
        };

        let Some(symbol) = symbol else {
            debug!(article_id = %article.article_id, "no symbol resolved for article");
            return;
        };

        let key = (symbol.clone(), article.article_id.clone());
        let now = Instant::now();
        if let Some(last) = recent.get(&key) {
            if now.duration_since(*last) < DEDUP_WINDOW {
                debug!(%symbol, article_id = %article.article_id, "duplicate ticker event suppressed");
                return;
            }
        }
        recent.retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
        recent.insert(key, now);

        let event = TickerEvent {
            symbol,
            article_id: article.article_id,
            published_at: article.published_at,
            received_at: Utc::now(),
        };
        if out.send(event).await.is_err() {
            warn!("detection stage queue closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_from_hint_rejects_ambiguous_list() {
        let hint = vec!["AAPL".to_string(), "MSFT".to_string()];
        assert!(resolve_from_hint(&hint).is_none());
    }

    #[test]
    fn resolve_from_hint_accepts_single_valid_symbol() {
        let hint = vec!["aapl".to_string()];
        assert_eq!(resolve_from_hint(&hint).unwrap().as_str(), "AAPL");
    }

    #[test]
    fn resolve_from_hint_skips_invalid_entries() {
        let hint = vec!["1INVALID".to_string(), "TSLA".to_string()];
        assert_eq!(resolve_from_hint(&hint).unwrap().as_str(), "TSLA");
    }
}
