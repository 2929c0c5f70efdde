#[cfg(test)]
pub mod corepc_node_helpers {
    use std::time::Duration;

    use bitcoin::{Address, BlockHash};
    use corepc_node::Node;

    use crate::rpc::{Auth, RpcReader};

    /// Get the authentication credentials for a given `bitcoind` instance.
    fn get_auth(bitcoind: &Node) -> (String, String) {
        let params = &bitcoind.params;
        let cookie_values = params.get_cookie_values().unwrap().unwrap();
        (cookie_values.user, cookie_values.password)
    }

    /// Mine a number of blocks of a given size `count`, which may be specified to a given coinbase
    /// `address`.
    pub fn mine_blocks(
        bitcoind: &Node,
        count: usize,
        address: Option<Address>,
    ) -> anyhow::Result<Vec<BlockHash>> {
        let coinbase_address = match address {
            Some(address) => address,
            None => bitcoind.client.new_address()?,
        };
        let block_hashes = bitcoind
            .client
            .generate_to_address(count as _, &coinbase_address)?
            .0
            .iter()
            .map(|hash| hash.parse::<BlockHash>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(block_hashes)
    }

    /// Spins up a regtest node and a watch-only [`RpcReader`] pointed at it,
    /// for tests that exercise descriptor derivation and reconciliation
    /// against actual network rules rather than mocked RPC responses.
    pub fn get_bitcoind_and_client() -> (Node, RpcReader) {
        let bitcoind = Node::from_downloaded().unwrap();

        let url = bitcoind.rpc_url();
        let (user, password) = get_auth(&bitcoind);
        let client = RpcReader::new(url, Auth::UserPass(user, password), Duration::from_secs(30)).unwrap();
        (bitcoind, client)
    }
}

#[cfg(test)]
mod regtest_descriptor_tests {
    use bitcoin::{Amount, Network};

    use super::corepc_node_helpers::{get_bitcoind_and_client, mine_blocks};
    use crate::descriptor::DescriptorEngine;

    const TPRV_DESC: &str = "wpkh(tpubD6NzVbkrYhZ4WZaiWHz59q5EQ61bd6dUYfU4ggRWAtNAyyYRNWT6ktJ7UHJEXURvTfTfskFQmK3HqKEX4DPnRV45aPofuRuu6s9QCbMQWB5/0/*)";

    /// Derives a watch-only address off a descriptor and checks it against
    /// an actual regtest node: fund it, mine a confirming block, and confirm
    /// the node's own `listunspent` agrees with the derived scriptPubKey --
    /// a round-trip the offline unit tests in `descriptor.rs` can't exercise
    /// since they never touch network rules or the node's address encoding.
    #[tokio::test]
    async fn derived_address_receives_and_confirms_on_regtest() {
        let (bitcoind, client) = get_bitcoind_and_client();
        mine_blocks(&bitcoind, 101, None).unwrap();

        let engine = DescriptorEngine::parse(TPRV_DESC, Network::Regtest).unwrap();
        let (address, script_pubkey) = engine.derive(0).unwrap();

        let send_amount = Amount::from_sat(1_000_000);
        bitcoind.client.send_to_address(&address, send_amount).unwrap();
        mine_blocks(&bitcoind, 1, None).unwrap();

        let entries = client.list_unspent(1, &[address.to_string()], None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, send_amount);
        assert_eq!(entries[0].script_pubkey, script_pubkey.to_hex_string());
    }
}
