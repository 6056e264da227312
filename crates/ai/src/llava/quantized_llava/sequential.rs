use super::linear::QLinear;
use candle_core::{Module, Tensor};

/// forked from candle-nn/src/sequential.rs
/// candle's Sequential keeps `Vec<Box<dyn Module>>`, which is not Send, but
/// `Model::process` has to return a Send future while holding the model.
/// So the layers are a closed enum instead of trait objects.
pub enum QSequentialLayer {
    QLinear(QLinear),
    Activation(candle_nn::Activation),
}

/// A sequential layer combining multiple other layers.
pub struct QSequential {
    layers: Vec<QSequentialLayer>,
}

/// Creates a new empty sequential layer.
pub fn seq() -> QSequential {
    QSequential { layers: vec![] }
}

impl Module for QSequential {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            match layer {
                QSequentialLayer::QLinear(layer) => xs = layer.forward(&xs)?,
                QSequentialLayer::Activation(layer) => xs = layer.forward(&xs)?,
            }
        }
        Ok(xs)
    }
}

impl QSequential {
    /// Appends a layer after all the current layers.
    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, layer: QSequentialLayer) -> Self {
        self.layers.push(layer);
        self
    }
}

impl std::fmt::Debug for QSequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QSequential")
            .field("layers", &self.layers.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{seq, QSequentialLayer};
    use candle_core::{Device, Module, Tensor};

    #[test]
    fn test_layers_run_in_order() -> candle_core::Result<()> {
        let model = seq()
            .add(QSequentialLayer::Activation(candle_nn::Activation::Relu))
            .add(QSequentialLayer::Activation(candle_nn::Activation::Sigmoid));
        let xs = Tensor::new(&[-1f32, 0.0], &Device::Cpu)?;

        let ys = model.forward(&xs)?.to_vec1::<f32>()?;
        assert_eq!(ys, vec![0.5, 0.5]);
        assert_eq!(format!("{:?}", model), "QSequential { layers: 2 }");
        Ok(())
    }
}
