use super::offline::OfflineAuthenticator;
use super::{AuthError, AuthResponse, AuthState, OfflineSession, OfflineUser, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_QUEUE_CAPACITY: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Enable {
        user_id: String,
        pin: String,
        reply: Reply<OfflineUser>,
    },
    Login {
        pin: String,
        reply: Reply<OfflineUser>,
    },
    CheckSession {
        reply: Reply<OfflineSession>,
    },
    ChangePin {
        old_pin: String,
        new_pin: String,
        reply: Reply<()>,
    },
    Disable {
        reply: Reply<()>,
    },
    EndSession {
        reply: Reply<()>,
    },
    State {
        reply: Reply<AuthState>,
    },
}

/// Handle to the credential worker.
///
/// The worker runs one command at a time on its own task, independent of the
/// sync worker, so logins stay responsive while a pass is running.
#[derive(Debug, Clone)]
pub struct CredentialManager {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // PINs stay out of logs
        let name = match self {
            Command::Enable { .. } => "Enable",
            Command::Login { .. } => "Login",
            Command::CheckSession { .. } => "CheckSession",
            Command::ChangePin { .. } => "ChangePin",
            Command::Disable { .. } => "Disable",
            Command::EndSession { .. } => "EndSession",
            Command::State { .. } => "State",
        };
        f.write_str(name)
    }
}

impl CredentialManager {
    pub fn spawn(auth: OfflineAuthenticator) -> (Self, JoinHandle<()>) {
        let (commands, queue) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = tokio::spawn(run(auth, queue));
        (Self { commands }, handle)
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> AuthResponse<T> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(command(reply)).await.is_err() {
            return AuthResponse::from(Err::<T, _>(AuthError::Unavailable));
        }
        response
            .await
            .unwrap_or(Err(AuthError::Unavailable))
            .into()
    }

    pub async fn enable_offline_auth(&self, user_id: &str, pin: &str) -> AuthResponse<OfflineUser> {
        let (user_id, pin) = (user_id.to_string(), pin.to_string());
        self.call(|reply| Command::Enable {
            user_id,
            pin,
            reply,
        })
        .await
    }

    pub async fn login_offline(&self, pin: &str) -> AuthResponse<OfflineUser> {
        let pin = pin.to_string();
        self.call(|reply| Command::Login { pin, reply }).await
    }

    pub async fn check_offline_session(&self) -> AuthResponse<OfflineSession> {
        self.call(|reply| Command::CheckSession { reply }).await
    }

    pub async fn change_offline_pin(&self, old_pin: &str, new_pin: &str) -> AuthResponse<()> {
        let (old_pin, new_pin) = (old_pin.to_string(), new_pin.to_string());
        self.call(|reply| Command::ChangePin {
            old_pin,
            new_pin,
            reply,
        })
        .await
    }

    pub async fn disable_offline_auth(&self) -> AuthResponse<()> {
        self.call(|reply| Command::Disable { reply }).await
    }

    pub async fn end_offline_session(&self) -> AuthResponse<()> {
        self.call(|reply| Command::EndSession { reply }).await
    }

    pub async fn state(&self) -> AuthResponse<AuthState> {
        self.call(|reply| Command::State { reply }).await
    }
}

async fn run(auth: OfflineAuthenticator, mut queue: mpsc::Receiver<Command>) {
    while let Some(command) = queue.recv().await {
        tracing::debug!(command = ?command, "Credential command");
        match command {
            Command::Enable {
                user_id,
                pin,
                reply,
            } => {
                let _ = reply.send(auth.enable(&user_id, &pin).await);
            }
            Command::Login { pin, reply } => {
                let _ = reply.send(auth.login(&pin).await);
            }
            Command::CheckSession { reply } => {
                let _ = reply.send(auth.check_session().await);
            }
            Command::ChangePin {
                old_pin,
                new_pin,
                reply,
            } => {
                let _ = reply.send(auth.change_pin(&old_pin, &new_pin).await);
            }
            Command::Disable { reply } => {
                let _ = reply.send(auth.disable().await);
            }
            Command::EndSession { reply } => {
                let _ = reply.send(auth.end_session().await);
            }
            Command::State { reply } => {
                let _ = reply.send(auth.state().await);
            }
        }
    }
    tracing::debug!("Credential worker stopped");
}
