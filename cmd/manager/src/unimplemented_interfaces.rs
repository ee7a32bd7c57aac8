//! Placeholder `ImageFetcher`/`PackageParser`/`Hooks` wiring for the
//! `package-revision` controller. OCI image fetch, package linting and
//! provider/configuration-specific install hooks are all out of scope (they
//! belong to the wider Crossplane type system); these stubs exist so the
//! controller fails loudly with a clear `Fatal` error instead of the binary
//! simply not offering the interface at all.

use std::future::Future;
use std::pin::Pin;

use xrcore_engine::composite::FunctionRunner;
use xrcore_engine::error::{Error, Result};
use xrcore_engine::packages::{Hooks, ImageFetcher, PackageParser};
use xrcore_engine::types::{FunctionRequest, FunctionResponse, ParsedPackage, PackageRevision, PipelineStep};

pub struct UnimplementedFetcher;

impl ImageFetcher for UnimplementedFetcher {
    fn fetch(&self, image: &str) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + '_>> {
        let image = image.to_string();
        Box::pin(async move { Err(Error::Fatal(format!("no ImageFetcher configured, cannot fetch {image}"))) })
    }
}

pub struct UnimplementedParser;

impl PackageParser for UnimplementedParser {
    fn parse(&self, _layer: &[u8]) -> Result<ParsedPackage> {
        Err(Error::Fatal("no PackageParser configured".to_string()))
    }
}

pub struct NoopHooks;

impl Hooks for NoopHooks {
    fn pre(&self, _meta: &serde_json::Value, _revision: &PackageRevision, _deleting: bool) -> Result<()> {
        Ok(())
    }

    fn post(&self, _meta: &serde_json::Value, _revision: &PackageRevision) -> Result<()> {
        Ok(())
    }
}

/// The out-of-process composition-function gRPC client is out of scope;
/// this stub surfaces a `Fatal` result rather than pretending the pipeline
/// rendered something, so a composite's `Synced` condition reports the real
/// reason nothing got composed.
pub struct UnimplementedFunctionRunner;

impl FunctionRunner for UnimplementedFunctionRunner {
    fn run(
        &self,
        step: &PipelineStep,
        _request: FunctionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionResponse>> + Send + '_>> {
        let function_ref = step.function_ref.clone();
        Box::pin(async move { Err(Error::Fatal(format!("no FunctionRunner configured, cannot invoke {function_ref}"))) })
    }
}
