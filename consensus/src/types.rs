use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::header::{BlockHash, BlockHeader, sha256d};

pub type Txid = [u8; 32];

/// Upper bound on list lengths inside a single block.
const MAX_ITEMS: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Identifier over the legacy serialization, witness data excluded.
    pub fn txid(&self) -> Txid {
        let mut encoder = Encoder::new();
        self.encode_with(&mut encoder, false);
        sha256d(&encoder.into_inner())
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    fn encode_with(&self, encoder: &mut Encoder, witness: bool) {
        encoder.write_i32_le(self.version);
        if witness {
            encoder.write_u8(0x00);
            encoder.write_u8(0x01);
        }
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            encoder.write_bytes(&input.previous_output.txid);
            encoder.write_u32_le(input.previous_output.vout);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        if witness {
            for input in &self.inputs {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.encode_with(encoder, self.has_witness());
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;

        // A zero input count cannot start a legacy transaction, so 0x00 here
        // is the segwit marker.
        let segwit = decoder.peek_u8() == Some(0x00);
        if segwit {
            decoder.read_u8()?;
            if decoder.read_u8()? != 0x01 {
                return Err(DecodeError::InvalidValue("unknown segwit flag"));
            }
        }

        let input_count = decoder.read_count(MAX_ITEMS)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxIn {
                previous_output: OutPoint {
                    txid: decoder.read_fixed()?,
                    vout: decoder.read_u32_le()?,
                },
                script_sig: decoder.read_var_bytes()?,
                sequence: decoder.read_u32_le()?,
                witness: Vec::new(),
            });
        }

        let output_count = decoder.read_count(MAX_ITEMS)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOut {
                value: decoder.read_i64_le()?,
                script_pubkey: decoder.read_var_bytes()?,
            });
        }

        if segwit {
            for input in &mut inputs {
                let items = decoder.read_count(MAX_ITEMS)?;
                input.witness = (0..items)
                    .map(|_| decoder.read_var_bytes())
                    .collect::<Result<_, _>>()?;
            }
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.encode_fixed(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut header = BlockHeader::decode_fixed(decoder)?;
        let count = decoder.read_count(MAX_ITEMS)?;
        let transactions = (0..count)
            .map(|_| Transaction::consensus_decode(decoder))
            .collect::<Result<Vec<_>, _>>()?;
        header.tx_count = transactions.len() as u64;
        Ok(Self {
            header,
            transactions,
        })
    }
}
