//! Toy calculators used in documentation and tests.
//!
//! None of these model anything physical; they exercise the calculator contract with
//! closed-form outputs so that pipelines and samplers can be checked exactly.

use crate::calculator::{
    Calculator, CalculatorId, Initializer, InputPort, Inputs, Likelihood, Outputs, Value,
    DEFAULT_CATCH_ERRORS, LOGLIKELIHOOD,
};
use crate::errors::{CalculatorError, CalculatorResult, ErrorKind, RslikeResult};
use crate::likelihood::{FLATDATA, FLATTHEORY};
use crate::parameter::{Parameter, ParameterPrior};
use ndarray::Array1;

/// Name of the theory vector output of [`Polynomial`] and [`Shift`].
pub const MODEL: &str = "model";

fn port(port: Option<InputPort>) -> CalculatorResult<InputPort> {
    port.ok_or_else(|| CalculatorError::configuration("calculator is not initialised"))
}

/// `f(x) = x²`, reported both as the derived parameter `f` and (negated) as the log-likelihood.
#[derive(Debug, Default)]
pub struct Square;

impl Calculator for Square {
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()> {
        init.param(
            Parameter::new("x")
                .with_prior(ParameterPrior::uniform(-10.0, 10.0)?)
                .with_reference(ParameterPrior::normal(0.0, 1.0)?),
        )?;
        init.param(Parameter::derived("f", vec![]))
    }

    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs> {
        let x = inputs.param("x")?;
        Ok(Outputs::from([
            ("f".to_string(), Value::Scalar(x * x)),
            (LOGLIKELIHOOD.to_string(), Value::Scalar(-x * x)),
        ]))
    }

    fn as_likelihood(&self) -> Option<&dyn Likelihood> {
        Some(self)
    }
}

impl Likelihood for Square {}

/// Independent Gaussian log-likelihood of `ndim` parameters `x0..x{ndim-1}`.
#[derive(Debug, Clone)]
pub struct IsotropicGaussian {
    pub mean: Vec<f64>,
    pub sigma: f64,
}

impl IsotropicGaussian {
    pub fn new(mean: Vec<f64>, sigma: f64) -> Self {
        Self { mean, sigma }
    }

    pub fn names(&self) -> Vec<String> {
        (0..self.mean.len()).map(|i| format!("x{}", i)).collect()
    }
}

impl Calculator for IsotropicGaussian {
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()> {
        for (name, &mean) in self.names().into_iter().zip(&self.mean) {
            init.param(
                Parameter::new(name)
                    .with_value(mean)
                    .with_prior(ParameterPrior::uniform(mean - 20.0 * self.sigma, mean + 20.0 * self.sigma)?)
                    .with_reference(ParameterPrior::normal(mean, self.sigma)?),
            )?;
        }
        Ok(())
    }

    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs> {
        let mut chi2 = 0.0;
        for (name, &mean) in self.names().iter().zip(&self.mean) {
            let d = (inputs.param(name)? - mean) / self.sigma;
            chi2 += d * d;
        }
        Ok(Outputs::from([(
            LOGLIKELIHOOD.to_string(),
            Value::Scalar(-0.5 * chi2),
        )]))
    }

    fn as_likelihood(&self) -> Option<&dyn Likelihood> {
        Some(self)
    }
}

impl Likelihood for IsotropicGaussian {}

/// `model(x) = Σ c_i xⁱ` evaluated on a fixed grid, with coefficients `c0..c{order}`.
#[derive(Debug, Clone)]
pub struct Polynomial {
    pub x: Vec<f64>,
    pub order: usize,
    pub namespace: String,
}

impl Polynomial {
    pub fn new(x: Vec<f64>, order: usize) -> Self {
        Self {
            x,
            order,
            namespace: String::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn coefficient(&self, i: usize) -> String {
        Parameter::new(format!("c{}", i))
            .with_namespace(&self.namespace)
            .name()
            .to_string()
    }
}

impl Calculator for Polynomial {
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()> {
        for i in 0..=self.order {
            init.param(Parameter::new(self.coefficient(i)))?;
        }
        Ok(())
    }

    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs> {
        let coefficients = (0..=self.order)
            .map(|i| inputs.param(&self.coefficient(i)))
            .collect::<CalculatorResult<Vec<_>>>()?;
        let model: Array1<f64> = self
            .x
            .iter()
            // Horner's scheme
            .map(|&x| coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c))
            .collect();
        Ok(Outputs::from([(MODEL.to_string(), Value::Array(model))]))
    }
}

/// Adds the parameter `shift` to the model of its requirement.
#[derive(Debug, Clone)]
pub struct Shift {
    pub input: CalculatorId,
    pub name: String,
    port: Option<InputPort>,
}

impl Shift {
    pub fn new(input: CalculatorId, name: impl Into<String>) -> Self {
        Self {
            input,
            name: name.into(),
            port: None,
        }
    }
}

impl Calculator for Shift {
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()> {
        self.port = Some(init.require(self.input));
        init.param(Parameter::new(self.name.clone()))
    }

    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs> {
        let model = inputs.array(port(self.port)?, MODEL)?;
        let shift = inputs.param(&self.name)?;
        Ok(Outputs::from([(MODEL.to_string(), Value::Array(model + shift))]))
    }
}

/// Compares the model of a theory calculator to a fixed data vector.
#[derive(Debug, Clone)]
pub struct Observable {
    pub theory: CalculatorId,
    pub data: Vec<f64>,
    port: Option<InputPort>,
}

impl Observable {
    pub fn new(theory: CalculatorId, data: Vec<f64>) -> Self {
        Self {
            theory,
            data,
            port: None,
        }
    }
}

impl Calculator for Observable {
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()> {
        self.port = Some(init.require(self.theory));
        Ok(())
    }

    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs> {
        let theory = inputs.array(port(self.port)?, MODEL)?;
        if theory.len() != self.data.len() {
            return Err(CalculatorError::configuration(format!(
                "theory has size {} but data has size {}",
                theory.len(),
                self.data.len()
            )));
        }
        Ok(Outputs::from([
            (FLATDATA.to_string(), Value::from(self.data.clone())),
            (FLATTHEORY.to_string(), Value::Array(theory)),
        ]))
    }
}

/// Likelihood `-½ x²` that fails with `kind` whenever `x > threshold`.
#[derive(Debug, Clone)]
pub struct Faulty {
    pub threshold: f64,
    pub kind: ErrorKind,
}

impl Faulty {
    pub fn new(threshold: f64, kind: ErrorKind) -> Self {
        Self { threshold, kind }
    }
}

impl Calculator for Faulty {
    fn initialize(&mut self, init: &mut Initializer) -> RslikeResult<()> {
        init.param(Parameter::new("x"))
    }

    fn calculate(&mut self, inputs: &Inputs) -> CalculatorResult<Outputs> {
        let x = inputs.param("x")?;
        if x > self.threshold {
            return Err(CalculatorError::new(
                self.kind,
                format!("x = {} is above {}", x, self.threshold),
            ));
        }
        Ok(Outputs::from([(
            LOGLIKELIHOOD.to_string(),
            Value::Scalar(-0.5 * x * x),
        )]))
    }

    fn as_likelihood(&self) -> Option<&dyn Likelihood> {
        Some(self)
    }
}

impl Likelihood for Faulty {
    fn catch_errors(&self) -> Vec<ErrorKind> {
        DEFAULT_CATCH_ERRORS.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::OutputPort;
    use indexmap::IndexMap;

    #[test]
    fn polynomial_model() {
        let mut poly = Polynomial::new(vec![0.0, 1.0, 2.0], 2).with_namespace("poly");
        let mut init = Initializer::new();
        poly.initialize(&mut init).unwrap();
        assert_eq!(init.params().names(), vec!["poly.c0", "poly.c1", "poly.c2"]);

        let inputs = Inputs {
            params: IndexMap::from([("poly.c0", 1.0), ("poly.c1", 2.0), ("poly.c2", 3.0)]),
            upstream: vec![],
        };
        let outputs = poly.calculate(&inputs).unwrap();
        assert_eq!(outputs[MODEL].to_vec(), vec![1.0, 6.0, 17.0]);
    }

    #[test]
    fn shift_reads_upstream() {
        let mut shift = Shift::new(CalculatorId(0), "dx");
        let mut init = Initializer::new();
        shift.initialize(&mut init).unwrap();

        let mut upstream = OutputPort::default();
        upstream.publish(Outputs::from([(MODEL.to_string(), Value::from(vec![1.0, 2.0]))]));
        let inputs = Inputs {
            params: IndexMap::from([("dx", 0.5)]),
            upstream: vec![&upstream],
        };
        let outputs = shift.calculate(&inputs).unwrap();
        assert_eq!(outputs[MODEL].to_vec(), vec![1.5, 2.5]);
    }

    #[test]
    fn faulty_raises_above_threshold() {
        let mut faulty = Faulty::new(1.0, ErrorKind::Other);
        let inputs = Inputs {
            params: IndexMap::from([("x", 2.0)]),
            upstream: vec![],
        };
        assert_eq!(faulty.calculate(&inputs).unwrap_err().kind, ErrorKind::Other);
    }
}
