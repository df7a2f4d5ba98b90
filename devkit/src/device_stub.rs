/*!
Device simulé pour développement sans matériel

Répond aux commandes du kernel comme une vraie poubelle connectée
(`getHumidity` → `humid:25.0`, ...). Enregistre toutes les commandes reçues
et permet d'envoyer de la télémétrie spontanée.
*/

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Comportement du device simulé
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    humidity: f64,
    level: f64,
    temperature: f64,
    status: String,
    serial: u64,
    overrides: HashMap<String, String>,
    reply_delay: Duration,
    silent: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            humidity: 50.0,
            level: 30.0,
            temperature: 20.0,
            status: "OK".to_string(),
            serial: 123456,
            overrides: HashMap::new(),
            reply_delay: Duration::ZERO,
            silent: false,
        }
    }
}

impl DeviceProfile {
    pub fn humidity(mut self, value: f64) -> Self {
        self.humidity = value;
        self
    }

    pub fn level(mut self, value: f64) -> Self {
        self.level = value;
        self
    }

    pub fn temperature(mut self, value: f64) -> Self {
        self.temperature = value;
        self
    }

    pub fn status<S: Into<String>>(mut self, token: S) -> Self {
        self.status = token.into();
        self
    }

    pub fn serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    /// Force la réponse à une commande exacte (ex: réponse malformée)
    pub fn reply<C: Into<String>, R: Into<String>>(mut self, command: C, reply: R) -> Self {
        self.overrides.insert(command.into(), reply.into());
        self
    }

    /// Délai avant chaque réponse (device lent)
    pub fn reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Lit les commandes mais ne répond jamais
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Réponse du device à une commande, None si le profil est muet
    pub fn answer(&self, command: &str) -> Option<String> {
        if self.silent {
            return None;
        }
        if let Some(reply) = self.overrides.get(command) {
            return Some(reply.clone());
        }
        let reply = match command {
            "getHumidity" => format!("humid:{:.1}", self.humidity),
            "getTemperature" => format!("tempe:{:.1}", self.temperature),
            "getCurrentLevel" => format!("level:{:.1}", self.level),
            "getStatus" => format!("statu:{}", self.status),
            "getSerialNumber" => self.serial.to_string(),
            "calibrateDevice" | "activateBuzzer" => "OK".to_string(),
            cmd if cmd.starts_with("setFillThreshold:") => "Threshold set".to_string(),
            _ => "ERR unknown command".to_string(),
        };
        Some(reply)
    }
}

/// Device simulé attaché à un transport ; arrêté quand il est droppé
pub struct SimulatedDevice {
    commands: Arc<Mutex<Vec<String>>>,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl SimulatedDevice {
    /// Connexion TCP au listener du kernel
    pub async fn connect(addr: SocketAddr, profile: DeviceProfile) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        log::info!("🗑️ [SIM] device connected to {}", addr);
        Ok(Self::attach(stream, profile))
    }

    /// Attache le device à n'importe quel transport (ex: `tokio::io::duplex`)
    pub fn attach<S>(stream: S, profile: DeviceProfile) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(stream, profile, commands.clone(), rx));
        Self { commands, outbound, task }
    }

    /// Commandes reçues, dans l'ordre
    pub fn received_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    /// Envoie une trame spontanée au kernel (ex: "level:80.0")
    pub fn push_telemetry<S: Into<String>>(&self, payload: S) -> Result<()> {
        self.outbound
            .send(payload.into())
            .map_err(|e| anyhow::anyhow!("device task stopped: {}", e))
    }

    /// Coupe le transport côté device
    pub fn disconnect(self) {
        self.task.abort();
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(
    mut stream: S,
    profile: DeviceProfile,
    commands: Arc<Mutex<Vec<String>>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; 1024];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let command = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                commands.lock().unwrap().push(command.clone());
                log::debug!("📥 [SIM] received {}", command);

                let Some(reply) = profile.answer(&command) else { continue };
                if !profile.reply_delay.is_zero() {
                    tokio::time::sleep(profile.reply_delay).await;
                }
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            Some(payload) = outbound.recv() => {
                if stream.write_all(payload.as_bytes()).await.is_err() {
                    break;
                }
                log::debug!("📤 [SIM] pushed {}", payload);
            }
        }
    }
    log::info!("🔌 [SIM] device transport closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_answers() {
        let profile = DeviceProfile::default().humidity(25.0).level(12.34);
        assert_eq!(profile.answer("getHumidity").unwrap(), "humid:25.0");
        assert_eq!(profile.answer("getCurrentLevel").unwrap(), "level:12.3");
        assert_eq!(profile.answer("getStatus").unwrap(), "statu:OK");
        assert_eq!(profile.answer("getSerialNumber").unwrap(), "123456");
        assert_eq!(profile.answer("setFillThreshold:80").unwrap(), "Threshold set");
        assert_eq!(profile.answer("activateBuzzer").unwrap(), "OK");
    }

    #[test]
    fn test_overrides_and_silence() {
        let profile = DeviceProfile::default().reply("getHumidity", "garbage");
        assert_eq!(profile.answer("getHumidity").unwrap(), "garbage");
        assert!(DeviceProfile::default().silent().answer("getHumidity").is_none());
    }

    #[tokio::test]
    async fn test_device_over_duplex() {
        let (mut kernel_side, device_side) = tokio::io::duplex(256);
        let device = SimulatedDevice::attach(device_side, DeviceProfile::default().temperature(18.0));

        kernel_side.write_all(b"getTemperature").await.unwrap();
        let mut buf = [0u8; 64];
        let n = kernel_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tempe:18.0");

        device.push_telemetry("humid:40.0").unwrap();
        let n = kernel_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"humid:40.0");
        assert_eq!(device.received_commands(), vec!["getTemperature"]);
    }
}
