mod image_caption;

use crate::HandlerPayload;
pub use image_caption::*;
use futures::FutureExt;
use std::any::Any;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

pub trait Model {
    type Item;
    type Output;

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<anyhow::Result<Self::Output>>>> + Send;

    fn batch_size_limit(&self) -> usize;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub type BatchHandlerTx<Item, Output> = mpsc::Sender<HandlerPayload<Item, Output>>;

/// Handle to a model living on its own thread.
///
/// Every clone talks to the same loaded model, requests are handled one
/// at a time in arrival order. The model is dropped once the last handle
/// is gone.
#[derive(Debug)]
pub struct AIModel<TItem, TOutput> {
    model_id: String, // for better logging
    tx: BatchHandlerTx<TItem, TOutput>,
}

impl<TItem, TOutput> Clone for AIModel<TItem, TOutput> {
    fn clone(&self) -> Self {
        Self {
            model_id: self.model_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<TItem, TOutput> AIModel<TItem, TOutput>
where
    TItem: Send + Sync + Clone + Debug + 'static,
    TOutput: Send + Sync + Debug + 'static,
{
    /// Spawn the model thread and wait until `create_model` has finished.
    /// A model that fails to load is reported here, not on the first request.
    pub async fn new<T, TFut, TFn>(
        model_id: impl Into<String>,
        create_model: TFn,
    ) -> anyhow::Result<Self>
    where
        T: Model<Item = TItem, Output = TOutput> + 'static,
        TFut: Future<Output = anyhow::Result<T>> + 'static,
        TFn: FnOnce() -> TFut + Send + 'static,
    {
        let model_id = model_id.into();
        let (tx, mut rx) = mpsc::channel::<HandlerPayload<TItem, TOutput>>(512);
        let (ready_tx, ready_rx) = oneshot::channel::<anyhow::Result<()>>();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread_model_id = model_id.clone();
        std::thread::Builder::new()
            .name(format!("ai-model-{}", model_id))
            .spawn(move || {
                let local = tokio::task::LocalSet::new();

                local.block_on(&rt, async move {
                    tracing::debug!("loading model {}", thread_model_id);
                    let mut model = match create_model().await {
                        Ok(model) => {
                            let _ = ready_tx.send(Ok(()));
                            model
                        }
                        Err(e) => {
                            tracing::error!("failed to load model {}: {}", thread_model_id, e);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    tracing::info!("model {} loaded", thread_model_id);

                    while let Some((items, result_tx)) = rx.recv().await {
                        // If channel closed,
                        // we have no way to response, just ignore task.
                        // This is very useful for task cancellation.
                        if result_tx.is_closed() {
                            tracing::debug!("receiver dropped, skip {} items", items.len());
                            continue;
                        }

                        // a panicking request fails alone, the model keeps serving
                        let results = match AssertUnwindSafe(model.process(items))
                            .catch_unwind()
                            .await
                        {
                            Ok(results) => results,
                            Err(panic) => {
                                let message = panic_message(panic.as_ref());
                                tracing::error!("model {} panicked: {}", thread_model_id, message);
                                Err(anyhow::anyhow!("model panicked: {}", message))
                            }
                        };

                        if result_tx.send(results).is_err() {
                            tracing::error!("failed to send results");
                        }
                    }

                    // this means all tx has been dropped
                    tracing::info!("all tx dropped, unload model {}", thread_model_id);
                    drop(model);
                });
            })?;

        match ready_rx.await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("model thread of {} exited before loading", model_id),
        }

        Ok(Self { model_id, tx })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[tracing::instrument(name = "AIModel::process", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process(&self, items: Vec<TItem>) -> anyhow::Result<Vec<anyhow::Result<TOutput>>> {
        let (result_tx, rx) = oneshot::channel();
        match self.tx.send((items, result_tx)).await {
            Ok(_) => {
                tracing::debug!("items sent to model");
            }
            Err(e) => {
                anyhow::bail!("failed to send items: {:?}", e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(e) => {
                anyhow::bail!("failed to receive results: {:?}", e);
            }
        }
    }

    #[tracing::instrument(name = "AIModel::process_single", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process_single(&self, item: TItem) -> anyhow::Result<TOutput> {
        let results = self.process(vec![item]).await?;
        let result = results
            .into_iter()
            .next()
            .ok_or(anyhow::anyhow!("no result"))??;
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::{AIModel, Model};

    struct EchoModel {
        calls: usize,
    }

    impl Model for EchoModel {
        type Item = String;
        type Output = String;

        fn batch_size_limit(&self) -> usize {
            2
        }

        async fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            if items.len() > self.batch_size_limit() {
                anyhow::bail!("too many items");
            }
            self.calls += 1;
            if items.iter().any(|v| v.as_str() == "boom") {
                panic!("boom requested");
            }

            Ok(items
                .into_iter()
                .map(|v| {
                    if v.is_empty() {
                        Err(anyhow::anyhow!("empty item"))
                    } else {
                        Ok(format!("{}#{}", v, self.calls))
                    }
                })
                .collect())
        }
    }

    async fn echo_model() -> AIModel<String, String> {
        AIModel::new("echo", || async { Ok(EchoModel { calls: 0 }) })
            .await
            .expect("load echo model")
    }

    #[test_log::test(tokio::test)]
    async fn test_process_single() {
        let model = echo_model().await;
        let result = model.process_single("hello".to_string()).await.unwrap();
        assert_eq!(result, "hello#1");
        assert_eq!(model.model_id(), "echo");
    }

    #[test_log::test(tokio::test)]
    async fn test_clones_share_loaded_model() {
        let model = echo_model().await;
        let other = model.clone();

        assert_eq!(model.process_single("a".into()).await.unwrap(), "a#1");
        assert_eq!(other.process_single("b".into()).await.unwrap(), "b#2");

        drop(model);
        assert_eq!(other.process_single("c".into()).await.unwrap(), "c#3");
    }

    #[test_log::test(tokio::test)]
    async fn test_item_errors_are_kept_per_item() {
        let model = echo_model().await;
        let results = model
            .process(vec!["x".to_string(), String::new()])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "x#1");
        assert!(results[1].is_err());

        assert!(model.process_single(String::new()).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_batch_over_limit_fails() {
        let model = echo_model().await;
        let result = model
            .process(vec!["a".into(), "b".into(), "c".into()])
            .await;
        assert!(result.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_load_failure_is_reported() {
        let result: anyhow::Result<AIModel<String, String>> =
            AIModel::new("broken", || async {
                Err::<EchoModel, _>(anyhow::anyhow!("weights missing"))
            })
            .await;

        let err = result.expect_err("loading should fail");
        assert!(err.to_string().contains("weights missing"));
    }

    #[test_log::test(tokio::test)]
    async fn test_panic_fails_only_its_request() {
        let model = echo_model().await;

        let err = model
            .process_single("boom".to_string())
            .await
            .expect_err("panicking request should fail");
        assert!(err.to_string().contains("boom requested"), "{}", err);

        // same model instance, call count kept
        assert_eq!(model.process_single("next".into()).await.unwrap(), "next#2");
        assert_eq!(model.clone().process_single("again".into()).await.unwrap(), "again#3");
    }
}
