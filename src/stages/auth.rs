//! SAS token renewal and replacement.

use tracing::{debug, info, warn};

use crate::{
    auth::{AuthenticationProvider, NonRenewableSasToken, SasToken, SasTokenError},
    error::PipelineError,
    pipeline::{Event, OpKind, OpOutput, OpResult, Operation, Stage, StageContext, StageTimer, TimerId},
};

/// Keeps the pipeline's SAS token fresh.
///
/// On `Initialize` the stage arms a renewal timer `margin` before expiry.
/// When it fires a renewable token is re-signed and, if connected, the
/// connection is reauthorized with it. An application-supplied token cannot be
/// re-signed, so the application is asked for a new one instead. A failed
/// renewal is retried after the connection retry interval.
#[derive(Debug, Default)]
pub(crate) struct SasTokenRenewalStage {
    provider: Option<AuthenticationProvider>,
    timer: Option<TimerId>,
    retry: Option<StageTimer>,
}

impl SasTokenRenewalStage {
    fn schedule(&mut self, ctx: &mut StageContext<'_>) -> Result<(), SasTokenError> {
        let Some(provider) = self.provider.as_mut() else {
            return Ok(());
        };
        let config = ctx.config();
        let (id, fire) = ctx.timer_trigger();
        provider.schedule(config.clock.as_ref(), fire)?;
        self.timer = Some(id);
        Ok(())
    }

    fn update_token(&mut self, op: Operation, token: NonRenewableSasToken, ctx: &mut StageContext<'_>) {
        let Some(provider) = self.provider.as_ref() else {
            ctx.complete(op, Err(PipelineError::Client("no SAS token in use".into())));
            return;
        };
        if provider.token().is_renewable() {
            ctx.complete(
                op,
                Err(PipelineError::Client("cannot replace a renewable SAS token".into())),
            );
            return;
        }
        provider.token().replace(SasToken::NonRenewable(token));
        info!(expiry = provider.token().expiry_time(), "sas token replaced");
        if let Err(err) = self.schedule(ctx) {
            ctx.complete(op, Err(err.into()));
            return;
        }
        if ctx.connected() {
            ctx.send_down(Operation::worker(OpKind::Reauthorize, op));
        } else {
            ctx.complete(op, Ok(OpOutput::Done));
        }
    }
}

impl Stage for SasTokenRenewalStage {
    fn name(&self) -> &'static str { "sas_token_renewal" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        match &op.kind {
            OpKind::Initialize => {
                let config = ctx.config();
                if let Some(token) = config.credential.sas_token() {
                    self.provider = Some(AuthenticationProvider::new(
                        token.clone(),
                        config.sastoken_renewal_margin,
                    ));
                    if let Err(err) = self.schedule(ctx) {
                        warn!(error = %err, "sas token renewal not scheduled");
                        ctx.background_error(err.into());
                    }
                }
                ctx.send_down(op);
            }
            OpKind::UpdateSasToken(token) => {
                let token = token.clone();
                self.update_token(op, token, ctx);
            }
            _ => ctx.send_down(op),
        }
    }

    fn on_timer(&mut self, id: TimerId, ctx: &mut StageContext<'_>) {
        let retry_due = self.retry.as_ref().is_some_and(|timer| timer.is(id));
        if !retry_due && self.timer != Some(id) {
            debug!(id, "ignoring stale renewal timer");
            return;
        }
        self.timer = None;
        self.retry = None;
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        if !provider.token().is_renewable() {
            info!("sas token expiring; requesting a new one");
            ctx.send_up(Event::NewSasTokenRequired);
            return;
        }
        if let Err(err) = provider.renew() {
            let delay = ctx.config().connection_retry_interval;
            warn!(error = %err, retry_in_ms = delay.as_millis(), "sas token renewal failed");
            self.retry = Some(ctx.start_timer(delay));
            ctx.background_error(err.into());
            return;
        }
        crate::metrics::inc_token_renewals();
        if let Err(err) = self.schedule(ctx) {
            ctx.background_error(err.into());
        }
        if ctx.connected() {
            ctx.send_down_intercepted(Operation::internal(OpKind::Reauthorize));
        }
    }

    fn on_op_complete(&mut self, op: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        if let Err(err) = &result {
            warn!(error = %err, "reauthorization after token renewal failed");
            ctx.background_error(err.clone());
        }
        ctx.complete(op, result);
    }
}
