use avroom_common::{deserialize, serialize, tracing, Request, Response, RouteInfo};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::matrix::DestinationTie;
use crate::SystemController;

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const SOCKET_MODE: u32 = 0o660;

/// IPC server for panels, schedulers and the CLI
pub struct IpcServer {
    socket_path: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl IpcServer {
    /// Create a new IPC server with the specified socket path
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Result<Self, std::io::Error> {
        let path = socket_path.as_ref().to_string_lossy().to_string();

        // Remove any stale socket file
        if Path::new(&path).exists() {
            fs::remove_file(&path)?;
        }

        Ok(Self {
            socket_path: path,
            shutdown_tx: None,
        })
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Bind the socket and serve requests against `controller`
    pub async fn start(&mut self, controller: Arc<SystemController>) -> Result<(), Box<dyn std::error::Error>> {
        info!("Starting IPC server at {}", self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        if let Err(e) = set_socket_permissions(&self.socket_path) {
            warn!("Failed to set socket permissions: {}", e);
        }

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        task::spawn(async move {
            loop {
                tokio::select! {
                    connection = listener.accept() => {
                        match connection {
                            Ok((stream, _)) => {
                                debug!("New client connected");
                                let controller = Arc::clone(&controller);
                                task::spawn(async move {
                                    if let Err(e) = handle_client(stream, controller).await {
                                        error!("Error handling client: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Error accepting connection: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("IPC accept loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop accepting clients and remove the socket file
    pub async fn shutdown(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Shutting down IPC server");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if Path::new(&self.socket_path).exists() {
            fs::remove_file(&self.socket_path)?;
        }

        Ok(())
    }
}

/// Owner and group may read/write, nobody else
fn set_socket_permissions(socket_path: &str) -> std::io::Result<()> {
    let mut perms = fs::metadata(socket_path)?.permissions();
    perms.set_mode(SOCKET_MODE);
    fs::set_permissions(socket_path, perms)
}

/// Serve one request on a client connection
pub async fn handle_client(
    mut stream: UnixStream,
    controller: Arc<SystemController>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_SIZE {
        warn!("Received oversized message: {} bytes", msg_len);
        return Err("Message too large".into());
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;

    let request: Request = deserialize(&msg_buf)?;
    debug!("Received request: {:?}", request);

    let response = handle_request(request, &controller).await;
    debug!("Sending response: {:?}", response);

    let response_bytes = serialize(&response);
    let len = response_bytes.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&response_bytes).await?;
    stream.flush().await?;

    Ok(())
}

fn routes(ties: Vec<DestinationTie>) -> Response {
    Response::Routes(
        ties.iter()
            .map(|t| t.destination.route_info(&t.tie))
            .collect::<Vec<RouteInfo>>(),
    )
}

/// Process a request and generate a response
async fn handle_request(request: Request, controller: &SystemController) -> Response {
    match request {
        Request::GetStatus => {
            let status = controller.status().await;
            Response::Status {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds: status.uptime.as_secs(),
                system_state: status.system_state,
                activity: status.activity,
                transition: status.transition,
                devices_count: status.devices_count,
            }
        }

        Request::RequestActivity { activity } => match controller.request_activity(activity).await {
            Ok(Some(transition)) => {
                info!("Activity {} requested over IPC: {:?}", activity, transition);
                Response::Ack
            }
            Ok(None) => {
                debug!("Activity {} already current or pending", activity);
                Response::Ack
            }
            Err(e) => Response::Error(e.to_string()),
        },

        Request::GetCurrentSources { update } => match controller.current_sources(update).await {
            Ok(ties) => routes(ties),
            Err(e) => Response::Error(e.to_string()),
        },

        Request::MatrixAction { actions } => match controller.apply_matrix_actions(&actions).await {
            Ok(ties) => routes(ties),
            Err(e) => Response::Error(e.to_string()),
        },

        Request::GetDevices => Response::Devices(controller.devices().await),

        Request::PromptShutdown => match controller.prompt_shutdown().await {
            Ok(true) => Response::Ack,
            Ok(false) => Response::Error("Shutdown can only be prompted while the room is active and idle".to_string()),
            Err(e) => Response::Error(e.to_string()),
        },
    }
}
