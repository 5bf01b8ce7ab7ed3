// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connecting → Authenticating walk, implemented as a small state machine
//! in the same shape as the project's `StateMachine`/`Transition` pattern.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::MuxError;
use crate::state_machine::common::{StateMachine, Transition};
use crate::wire::codec::{Frame, AUTH_REASON_OK};
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::{MAX_FRAME_PAYLOAD, PROTOCOL_VERSION};

pub struct HandshakeCtx<'a, T> {
    pub stream: &'a mut T,
    pub ingester_uuid: [u8; 16],
    pub ingester_name: String,
    pub secret: Vec<u8>,
}

type HandshakeStepOut = Transition<HandshakeStates, Result<(), MuxError>>;

pub enum HandshakeStates {
    SendHandshake(SendHandshake),
    SendAuth(SendAuth),
    AwaitAuthResp(AwaitAuthResp),
}

pub struct SendHandshake;
pub struct SendAuth;
pub struct AwaitAuthResp;

impl<'ctx, T> StateMachine<HandshakeCtx<'ctx, T>, HandshakeStepOut> for SendHandshake
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = HandshakeStepOut> + Send + 'a>>
    where
        Self: 'a,
        HandshakeStepOut: 'a,
        HandshakeCtx<'ctx, T>: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut HandshakeCtx<'ctx, T>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let frame = Frame::Handshake {
                version: PROTOCOL_VERSION,
                flags: 0,
                ingester_uuid: ctx.ingester_uuid,
                ingester_name: ctx.ingester_name.clone(),
            };
            debug!("sending HANDSHAKE");
            match write_frame(ctx.stream, frame.command_id(), &frame.encode_payload()).await {
                Ok(()) => Transition::Next(HandshakeStates::SendAuth(SendAuth), Ok(())),
                Err(e) => Transition::Done(Err(MuxError::transport(format!("writing HANDSHAKE: {e}")))),
            }
        })
    }
}

impl<'ctx, T> StateMachine<HandshakeCtx<'ctx, T>, HandshakeStepOut> for SendAuth
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = HandshakeStepOut> + Send + 'a>>
    where
        Self: 'a,
        HandshakeStepOut: 'a,
        HandshakeCtx<'ctx, T>: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut HandshakeCtx<'ctx, T>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let frame = Frame::Auth { secret: Bytes::from(ctx.secret.clone()) };
            debug!("sending AUTH");
            match write_frame(ctx.stream, frame.command_id(), &frame.encode_payload()).await {
                Ok(()) => Transition::Next(HandshakeStates::AwaitAuthResp(AwaitAuthResp), Ok(())),
                Err(e) => Transition::Done(Err(MuxError::transport(format!("writing AUTH: {e}")))),
            }
        })
    }
}

impl<'ctx, T> StateMachine<HandshakeCtx<'ctx, T>, HandshakeStepOut> for AwaitAuthResp
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    type StepResult<'a>
        = std::pin::Pin<Box<dyn std::future::Future<Output = HandshakeStepOut> + Send + 'a>>
    where
        Self: 'a,
        HandshakeStepOut: 'a,
        HandshakeCtx<'ctx, T>: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut HandshakeCtx<'ctx, T>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let (hdr, payload) = match read_frame(ctx.stream, MAX_FRAME_PAYLOAD).await {
                Ok(v) => v,
                Err(e) => return Transition::Done(Err(e)),
            };
            let frame = match Frame::decode(hdr.id, payload) {
                Ok(f) => f,
                Err(e) => return Transition::Done(Err(e)),
            };
            match frame {
                Frame::AuthResp { ok: true, reason } if reason == AUTH_REASON_OK => {
                    debug!("AUTH_RESP ok");
                    Transition::Done(Ok(()))
                }
                Frame::AuthResp { ok, reason } => Transition::Done(Err(MuxError::auth(format!(
                    "indexer rejected authentication (ok={ok}, reason=0x{reason:02x})"
                )))),
                other => Transition::Done(Err(MuxError::protocol(format!(
                    "expected AUTH_RESP, got command 0x{:02x}",
                    other.command_id()
                )))),
            }
        })
    }
}

/// Drive the handshake to completion: HANDSHAKE, AUTH, then await
/// AUTH_RESP. Returns `Err(MuxError::Auth(_))` for a rejected secret
/// (fatal, not retried) and `Err(MuxError::Transport(_))` /
/// `Err(MuxError::Protocol(_))` for anything recoverable by reconnect.
pub async fn run_handshake<T>(stream: &mut T, ingester_uuid: [u8; 16], ingester_name: String, secret: Vec<u8>) -> Result<(), MuxError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut ctx = HandshakeCtx { stream, ingester_uuid, ingester_name, secret };
    let mut state = HandshakeStates::SendHandshake(SendHandshake);
    loop {
        let tr = match &mut state {
            HandshakeStates::SendHandshake(s) => s.step(&mut ctx).await,
            HandshakeStates::SendAuth(s) => s.step(&mut ctx).await,
            HandshakeStates::AwaitAuthResp(s) => s.step(&mut ctx).await,
        };
        match tr {
            Transition::Next(next, _) => state = next,
            Transition::Stay(r) => {
                if let Err(e) = r {
                    return Err(e);
                }
            }
            Transition::Done(r) => return r,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::wire::codec::AUTH_REASON_BAD_SECRET;

    async fn respond_auth(server: &mut (impl AsyncRead + AsyncWrite + Unpin + Send), ok: bool, reason: u8) {
        let _ = read_frame(server, MAX_FRAME_PAYLOAD).await.unwrap();
        let _ = read_frame(server, MAX_FRAME_PAYLOAD).await.unwrap();
        let f = Frame::AuthResp { ok, reason };
        write_frame(server, f.command_id(), &f.encode_payload()).await.unwrap();
    }

    #[tokio::test]
    async fn succeeds_on_ok_auth_resp() {
        let (mut client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            respond_auth(&mut server, true, AUTH_REASON_OK).await;
        });
        let result = run_handshake(&mut client, [0u8; 16], "demo".into(), b"secret".to_vec()).await;
        server_task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn fails_fatally_on_rejected_auth() {
        let (mut client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            respond_auth(&mut server, false, AUTH_REASON_BAD_SECRET).await;
        });
        let result = run_handshake(&mut client, [0u8; 16], "demo".into(), b"wrong".to_vec()).await;
        server_task.await.unwrap();
        assert!(matches!(result, Err(MuxError::Auth(_))));
    }
}
