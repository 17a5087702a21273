mod interleaving;
