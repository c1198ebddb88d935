use ecco_common::api::{
    CreateFunctionRequest, FunctionConfiguration, FunctionState, UpdateFunctionRequest,
};
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::backend::{ComputeBackend, ImageRegistry};
use crate::error::PipelineError;

/// Mantiene al día la función de cada clase (dimensión × product type).
pub struct FunctionManager {
    compute: Arc<dyn ComputeBackend>,
    images: Arc<dyn ImageRegistry>,
    poll_every: Duration,
    activation_timeout: Duration,
    function_timeout_secs: u64,
}

impl FunctionManager {
    pub fn new(
        compute: Arc<dyn ComputeBackend>,
        images: Arc<dyn ImageRegistry>,
        poll_every: Duration,
        activation_timeout: Duration,
        function_timeout_secs: u64,
    ) -> Self {
        Self {
            compute,
            images,
            poll_every,
            activation_timeout,
            function_timeout_secs,
        }
    }

    /// Crea o actualiza la función para que use `image_ref` y `memory_size`.
    /// Sin cambios de imagen entre dos llamadas, la segunda no toca nada.
    pub async fn ensure_current(
        &self,
        name: &str,
        image_ref: &str,
        memory_size: u32,
    ) -> Result<FunctionConfiguration, PipelineError> {
        let existing = self
            .compute
            .list_functions()
            .await?
            .into_iter()
            .find(|f| f.name == name);

        let Some(current) = existing else {
            info!("creando función {} ({} MB, imagen {})", name, memory_size, image_ref);
            self.compute
                .create_function(&CreateFunctionRequest {
                    name: name.to_string(),
                    memory_size,
                    image_ref: image_ref.to_string(),
                    timeout_secs: Some(self.function_timeout_secs),
                })
                .await?;
            return self.wait_active(name).await;
        };

        let image = self.images.describe_image(image_ref).await?;

        let mut update = UpdateFunctionRequest::default();
        if current.image_ref != image_ref
            || image.last_pushed > current.last_modified
            || current.state == FunctionState::Failed
        {
            update.image_ref = Some(image_ref.to_string());
        }
        if current.memory_size != memory_size {
            update.memory_size = Some(memory_size);
        }

        if update.is_empty() {
            debug!("función {} al día", name);
            return match current.state {
                FunctionState::Pending => self.wait_active(name).await,
                _ => Ok(current),
            };
        }

        info!(
            "actualizando función {} (imagen: {:?}, memoria: {:?})",
            name, update.image_ref, update.memory_size
        );
        self.compute.update_function(name, &update).await?;
        self.wait_active(name).await
    }

    async fn wait_active(&self, name: &str) -> Result<FunctionConfiguration, PipelineError> {
        let deadline = Instant::now() + self.activation_timeout;
        let mut ticker = interval(self.poll_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let f = self.compute.get_function(name).await?;
            match f.state {
                FunctionState::Active => {
                    info!("función {} activa", name);
                    return Ok(f);
                }
                FunctionState::Failed => {
                    return Err(PipelineError::FunctionFailed {
                        name: name.to_string(),
                        reason: f.state_reason.unwrap_or_default(),
                    })
                }
                FunctionState::Pending if Instant::now() >= deadline => {
                    return Err(PipelineError::ActivationTimeout {
                        name: name.to_string(),
                        secs: self.activation_timeout.as_secs(),
                    })
                }
                FunctionState::Pending => debug!("función {} todavía Pending", name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{old_date, FakeBackend};
    use chrono::Utc;

    fn manager(fake: &Arc<FakeBackend>) -> FunctionManager {
        FunctionManager::new(
            fake.clone(),
            fake.clone(),
            Duration::from_millis(5),
            Duration::from_millis(100),
            900,
        )
    }

    fn existing(name: &str, memory_size: u32) -> FunctionConfiguration {
        FunctionConfiguration {
            name: name.to_string(),
            memory_size,
            image_ref: "img".to_string(),
            last_modified: Utc::now(),
            state: FunctionState::Active,
            state_reason: None,
            timeout_secs: 900,
        }
    }

    #[tokio::test]
    async fn crea_la_funcion_y_es_idempotente() {
        let fake = Arc::new(FakeBackend::default());
        let m = manager(&fake);

        let f = m.ensure_current("ecco_granule_2D_latlon", "img", 2048).await.unwrap();
        assert_eq!(f.state, FunctionState::Active);
        assert_eq!(f.memory_size, 2048);

        let before = fake.calls();
        m.ensure_current("ecco_granule_2D_latlon", "img", 2048).await.unwrap();
        let after = fake.calls();
        assert_eq!(before.iter().filter(|c| c.starts_with("create")).count(), 1);
        // la segunda llamada sólo lista
        assert_eq!(&after[before.len()..], &["list".to_string()]);
    }

    #[tokio::test]
    async fn imagen_nueva_o_memoria_distinta_actualiza() {
        let fake = Arc::new(FakeBackend::default());
        let mut f = existing("f", 1024);
        f.last_modified = old_date();
        fake.add_function(f);
        *fake.image_pushed.lock().unwrap() = Utc::now();

        let m = manager(&fake);
        m.ensure_current("f", "img", 1024).await.unwrap();
        assert!(fake.calls().contains(&"update:f".to_string()));

        let g = existing("g", 1024);
        fake.add_function(g);
        let updated = m.ensure_current("g", "img", 4096).await.unwrap();
        assert_eq!(updated.memory_size, 4096);
        assert!(fake.calls().contains(&"update:g".to_string()));
    }

    #[tokio::test]
    async fn activacion_fallida_es_fatal() {
        let fake = Arc::new(FakeBackend::default());
        *fake.activate_as.lock().unwrap() = FunctionState::Failed;

        let err = manager(&fake)
            .ensure_current("rota", "img", 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FunctionFailed { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn pending_eterno_vence_por_timeout() {
        let fake = Arc::new(FakeBackend::default());
        *fake.activate_as.lock().unwrap() = FunctionState::Pending;

        let err = manager(&fake)
            .ensure_current("lenta", "img", 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ActivationTimeout { .. }));
    }
}
