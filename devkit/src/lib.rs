/*!
# Binlink DevKit - Device simulé et utilitaires pour développement

Bibliothèque facilitant le développement et les tests du kernel sans matériel :
- Device poubelle simulé parlant le protocole texte (TCP ou pipe en mémoire)
- Journal des commandes reçues pour les assertions
- Helpers d'attente pour les tests asynchrones
*/

pub mod device_stub;
pub mod test_utils;

pub use device_stub::{DeviceProfile, SimulatedDevice};
pub use test_utils::{init_test_logging, wait_for};
