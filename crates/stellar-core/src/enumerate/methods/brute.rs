//! Dictionary brute-force method: dictionary × root.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Candidate, EnumMethod};

/// Produces `{word}.{root}` for every dictionary word.
pub struct DnsBrute {
    dictionary: Vec<String>,
}

impl DnsBrute {
    pub fn new(dictionary: Vec<String>) -> Self {
        Self { dictionary }
    }
}

pub const METHOD_NAME: &str = "dns_brute";

#[async_trait]
impl EnumMethod for DnsBrute {
    fn name(&self) -> &str {
        METHOD_NAME
    }

    fn estimate(&self) -> Option<u64> {
        Some(self.dictionary.len() as u64)
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        root: &str,
        out: mpsc::Sender<Candidate>,
    ) -> anyhow::Result<()> {
        for word in &self.dictionary {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let word = word.trim();
            if word.is_empty() || word.starts_with('#') {
                continue;
            }
            let candidate = Candidate {
                name: format!("{word}.{root}"),
                source: METHOD_NAME.to_owned(),
            };
            if out.send(candidate).await.is_err() {
                // Consumer gone: the pipeline is shutting down.
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_word_by_root_candidates() {
        let method = DnsBrute::new(vec!["www".into(), "mail".into()]);
        let (tx, mut rx) = mpsc::channel(8);
        method
            .run(CancellationToken::new(), "example.com", tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "www.example.com");
        assert_eq!(rx.recv().await.unwrap().name, "mail.example.com");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn skips_comments_and_blanks() {
        let method = DnsBrute::new(vec!["# comment".into(), "".into(), "api".into()]);
        let (tx, mut rx) = mpsc::channel(8);
        method
            .run(CancellationToken::new(), "example.com", tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "api.example.com");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn estimate_is_dictionary_size() {
        let method = DnsBrute::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(method.estimate(), Some(3));
    }
}
